//! Protocol engine shared by both roles
//!
//! The engine owns the transmit path (rolling buffer, CRC sealing, echo
//! confirmation) and the receive path (length check, echo suppression,
//! parsing). Role-specific behaviour is injected through [`RoleBehavior`].
//!
//! # Echo handling
//!
//! ```text
//!  flush()                          reception task
//!  ───────                          ──────────────
//!  seal + remember (seq = n)
//!  transport.transmit ──► bus ──►   frame == last transmitted?
//!  wait echo_seq >= n  ◄─────────── yes: publish echo_seq = n, drop
//!                                   no:  parse, dispatch to role
//! ```

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::{BusConfig, TimingConfig};
use crate::error::{BusError, Result};
use crate::frame::{self, Frame, MessageType, SlaveAddress};
use crate::transport::FrameTransport;
use crate::wire::{self, MIN_WIRE_LEN};

/// Role-specific reactions to received frames
///
/// Called from the reception task; implementations must not block. Anything
/// slow is handed to the role's own tasks.
pub trait RoleBehavior: Send + Sync {
    /// DISCOVER received
    fn on_discover(&self, frame: &Frame);

    /// DISCOVER_FIN received
    fn on_discover_fin(&self, frame: &Frame);

    /// APPDATA received
    fn on_app_data(&self, frame: &Frame);

    /// APPDATA_ACK received
    fn on_app_data_ack(&self, frame: &Frame);
}

/// Route a frame to the matching role callback
pub fn dispatch(role: &dyn RoleBehavior, frame: &Frame) {
    match frame.kind {
        MessageType::Discover => role.on_discover(frame),
        MessageType::DiscoverFin => role.on_discover_fin(frame),
        MessageType::AppData => role.on_app_data(frame),
        MessageType::AppDataAck => role.on_app_data_ack(frame),
    }
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Frames handed to the transport
    pub frames_sent: u64,
    /// Frames received from other devices
    pub frames_received: u64,
    /// Own frames recognised on the receive path
    pub echoes_suppressed: u64,
    /// Frames dropped as too short or unparseable
    pub malformed_dropped: u64,
    /// Flushes that failed (write error, write or echo timeout)
    pub transmit_failures: u64,
    /// Master turns that ended without an acknowledgement
    pub ack_timeouts: u64,
    /// Discovery cycles started
    pub discovery_cycles: u64,
    /// Discovery cycles that ended in DISCOVER_FAILED
    pub discovery_failures: u64,
    /// Resets to INITIAL after the bus was READY
    pub rediscoveries: u64,
    /// Payloads handed to the frame handler
    pub payloads_delivered: u64,
}

/// Live counters behind [`BusStats`]
#[derive(Debug, Default)]
pub struct Counters {
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) echoes_suppressed: AtomicU64,
    pub(crate) malformed_dropped: AtomicU64,
    pub(crate) transmit_failures: AtomicU64,
    pub(crate) ack_timeouts: AtomicU64,
    pub(crate) discovery_cycles: AtomicU64,
    pub(crate) discovery_failures: AtomicU64,
    pub(crate) rediscoveries: AtomicU64,
    pub(crate) payloads_delivered: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot
    pub fn snapshot(&self) -> BusStats {
        BusStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            echoes_suppressed: self.echoes_suppressed.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            transmit_failures: self.transmit_failures.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            discovery_cycles: self.discovery_cycles.load(Ordering::Relaxed),
            discovery_failures: self.discovery_failures.load(Ordering::Relaxed),
            rediscoveries: self.rediscoveries.load(Ordering::Relaxed),
            payloads_delivered: self.payloads_delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct LastTransmit {
    seq: u64,
    wire: Bytes,
}

/// Framing, transmission and echo suppression for one device
pub struct ProtocolEngine {
    transport: Arc<dyn FrameTransport>,
    timing: TimingConfig,
    receive_capacity: usize,
    /// Rolling transmit buffer, filled by `send`
    tx_buffer: Mutex<BytesMut>,
    /// Held for the duration of one send+flush
    in_flight: tokio::sync::Mutex<()>,
    last_tx: Mutex<Option<LastTransmit>>,
    tx_seq: AtomicU64,
    echo_seq: watch::Sender<u64>,
    counters: Counters,
}

impl ProtocolEngine {
    /// Create an engine on top of a transport
    pub fn new(transport: Arc<dyn FrameTransport>, config: &BusConfig) -> Self {
        let (echo_seq, _) = watch::channel(0);
        Self {
            transport,
            timing: config.timing.clone(),
            receive_capacity: config.queue.receive_capacity,
            tx_buffer: Mutex::new(BytesMut::with_capacity(wire::MAX_WIRE_FRAME)),
            in_flight: tokio::sync::Mutex::new(()),
            last_tx: Mutex::new(None),
            tx_seq: AtomicU64::new(0),
            echo_seq,
            counters: Counters::default(),
        }
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn FrameTransport> {
        &self.transport
    }

    /// Live counters
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Counter snapshot
    pub fn stats(&self) -> BusStats {
        self.counters.snapshot()
    }

    /// Append a frame to the transmit buffer without sending it
    pub fn send(&self, kind: MessageType, address: SlaveAddress, payload: &[u8]) {
        let mut buf = self.tx_buffer.lock();
        frame::encode_parts(&mut buf, kind, address, payload);
        trace!(%kind, %address, size = buf.len(), "Buffered frame");
    }

    /// Seal and transmit the buffered bytes, then wait for their echo
    ///
    /// Blocks for at most [`BusConfig::flush_budget`]. Returns the number of
    /// body bytes flushed. A failed flush still leaves the frame registered
    /// as the last transmission, so an echo arriving after the deadline is
    /// suppressed rather than dispatched.
    pub async fn flush(&self) -> Result<usize> {
        let _turn = self.in_flight.lock().await;
        self.flush_locked().await
    }

    /// `send` followed by `flush`, with no other frame in between
    pub async fn transmit(
        &self,
        kind: MessageType,
        address: SlaveAddress,
        payload: &[u8],
    ) -> Result<()> {
        let _turn = self.in_flight.lock().await;
        self.send(kind, address, payload);
        self.flush_locked().await.map(|_| ())
    }

    async fn flush_locked(&self) -> Result<usize> {
        let body = {
            let mut buf = self.tx_buffer.lock();
            if buf.is_empty() {
                return Ok(0);
            }
            buf.split().freeze()
        };

        let sealed = wire::seal(&body);
        let seq = self.tx_seq.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_tx.lock() = Some(LastTransmit {
            seq,
            wire: sealed.clone(),
        });
        let mut echo_rx = self.echo_seq.subscribe();

        let result = self.transmit_and_confirm(sealed, seq, &mut echo_rx).await;
        match &result {
            Ok(()) => {
                Counters::bump(&self.counters.frames_sent);
                debug!(size = body.len(), seq, "Frame flushed");
            }
            Err(e) => {
                Counters::bump(&self.counters.transmit_failures);
                warn!(error = %e, seq, "Flush failed");
            }
        }
        result.map(|()| body.len())
    }

    async fn transmit_and_confirm(
        &self,
        sealed: Bytes,
        seq: u64,
        echo_rx: &mut watch::Receiver<u64>,
    ) -> Result<()> {
        let write_timeout = self.timing.write_timeout;
        let echo_timeout = self.timing.echo_timeout_for(sealed.len());

        tokio::time::timeout(write_timeout, self.transport.transmit(sealed))
            .await
            .map_err(|_| BusError::WriteTimeout {
                duration_ms: write_timeout.as_millis() as u64,
            })??;

        tokio::time::timeout(echo_timeout, echo_rx.wait_for(|echoed| *echoed >= seq))
            .await
            .map_err(|_| BusError::EchoTimeout {
                duration_ms: echo_timeout.as_millis() as u64,
            })?
            .map(|_| ())
            .map_err(|_| BusError::ChannelClosed)
    }

    /// Classify a sealed frame delivered by the transport
    ///
    /// Returns the parsed frame for traffic from other devices, `None` for
    /// self-echoes and malformed input. Never blocks.
    pub fn on_frame_received(&self, raw: &[u8]) -> Option<Frame> {
        if raw.len() < MIN_WIRE_LEN {
            Counters::bump(&self.counters.malformed_dropped);
            warn!(len = raw.len(), min = MIN_WIRE_LEN, "Dropping short frame");
            return None;
        }

        {
            let mut last = self.last_tx.lock();
            let is_echo = last.as_ref().is_some_and(|l| l.wire.as_ref() == raw);
            if is_echo {
                if let Some(echo) = last.take() {
                    self.echo_seq.send_replace(echo.seq);
                    Counters::bump(&self.counters.echoes_suppressed);
                    trace!(seq = echo.seq, "Suppressed own echo");
                }
                return None;
            }
        }

        match Frame::parse(wire::strip(raw)) {
            Ok(frame) => {
                Counters::bump(&self.counters.frames_received);
                trace!(kind = %frame.kind, address = %frame.address, size = frame.payload.len(), "Received frame");
                Some(frame)
            }
            Err(e) => {
                Counters::bump(&self.counters.malformed_dropped);
                warn!(error = %e, "Dropping malformed frame");
                None
            }
        }
    }

    /// Classify a received frame and hand it to the role
    pub fn handle_received(&self, raw: &[u8], role: &dyn RoleBehavior) {
        if let Some(frame) = self.on_frame_received(raw) {
            dispatch(role, &frame);
        }
    }

    /// Restart the transport's reception pipeline and forget echo state
    pub async fn restart_reception(&self) -> Result<()> {
        self.last_tx.lock().take();
        self.transport.restart_reception().await
    }

    /// Attach to the transport and spawn the reception task
    pub fn spawn_reception(self: &Arc<Self>, role: Arc<dyn RoleBehavior>) -> JoinHandle<()> {
        let (sink, mut rx) = mpsc::channel::<Bytes>(self.receive_capacity);
        self.transport.attach_receiver(sink);

        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                engine.handle_received(&raw, role.as_ref());
            }
            debug!(transport = engine.transport.name(), "Reception channel closed");
        })
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("transport", &self.transport.name())
            .field("write_timeout", &self.timing.write_timeout)
            .field("echo_timeout", &self.timing.echo_timeout)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}
