//! In-process party-line bus
//!
//! Every frame transmitted by an attached port is delivered to every
//! connected port, the sender included, which reproduces the echo behaviour
//! of an open-drain two-wire bus. Ports can be disconnected to simulate a
//! slave falling off the bus, and raw bytes can be injected to exercise the
//! CRC check.
//!
//! By default delivery is instantaneous. A bus built with
//! [`MemoryBus::with_line_rate`] holds each frame for its transfer time and
//! serializes transmissions, like a real serial line.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{BusError, Result};
use crate::transport::{FrameSink, FrameTransport};
use crate::wire::{self, STREAM_HEADER_LEN};

/// Shared in-memory bus
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Debug, Default)]
struct BusInner {
    ports: Mutex<Vec<Arc<PortState>>>,
    monitors: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    frames_carried: AtomicU64,
    crc_dropped: AtomicU64,
    /// Baud rate; 0 delivers instantly
    line_rate: u32,
    busy_until: Mutex<Option<Instant>>,
}

#[derive(Debug)]
struct PortState {
    id: usize,
    name: String,
    sink: Mutex<Option<FrameSink>>,
    connected: AtomicBool,
    delivered: AtomicU64,
    overflowed: AtomicU64,
    restarts: AtomicU64,
}

/// Bus-level counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBusStats {
    /// Frames put on the wire
    pub frames_carried: u64,
    /// Frames discarded for a bad CRC
    pub crc_dropped: u64,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that delays every frame by its transfer time at `baud`
    pub fn with_line_rate(baud: u32) -> Self {
        Self {
            inner: Arc::new(BusInner {
                line_rate: baud,
                ..Default::default()
            }),
        }
    }

    /// Attach a new port
    pub fn attach(&self, name: impl Into<String>) -> Arc<MemoryPort> {
        let mut ports = self.inner.ports.lock();
        let state = Arc::new(PortState {
            id: ports.len(),
            name: format!("memory:{}", name.into()),
            sink: Mutex::new(None),
            connected: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        });
        ports.push(state.clone());
        debug!(port = %state.name, "Attached port to memory bus");

        Arc::new(MemoryPort {
            bus: self.inner.clone(),
            state,
        })
    }

    /// Observe every frame put on the wire
    pub fn monitor(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.monitors.lock().push(tx);
        rx
    }

    /// Put raw bytes on the wire as if some device had sent them
    ///
    /// Injected bytes bypass the line rate.
    pub fn inject(&self, raw: impl Into<Bytes>) {
        self.inner.carry(None, raw.into());
    }

    /// Bus-level counters
    pub fn stats(&self) -> MemoryBusStats {
        MemoryBusStats {
            frames_carried: self.inner.frames_carried.load(Ordering::Relaxed),
            crc_dropped: self.inner.crc_dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of attached ports
    pub fn port_count(&self) -> usize {
        self.inner.ports.lock().len()
    }
}

impl BusInner {
    /// Reserve the line for `len` bytes; returns when the last byte arrives
    fn reserve(&self, len: usize) -> Instant {
        let transfer = wire::transfer_time(len + STREAM_HEADER_LEN, self.line_rate);
        let mut busy = self.busy_until.lock();
        let start = match *busy {
            Some(until) if until > Instant::now() => until,
            _ => Instant::now(),
        };
        let done = start + transfer;
        *busy = Some(done);
        done
    }

    fn carry(&self, from: Option<usize>, frame: Bytes) {
        self.frames_carried.fetch_add(1, Ordering::Relaxed);
        self.monitors
            .lock()
            .retain(|tx| tx.send(frame.clone()).is_ok());

        if let Err(e) = wire::verify(&frame) {
            debug!(error = %e, "Dropping corrupt frame on memory bus");
            self.crc_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let ports: Vec<Arc<PortState>> = self.ports.lock().clone();
        for port in ports {
            if !port.connected.load(Ordering::SeqCst) {
                continue;
            }

            let sink = port.sink.lock().clone();
            let Some(sink) = sink else {
                continue;
            };

            match sink.try_send(frame.clone()) {
                Ok(()) => {
                    port.delivered.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        port = %port.name,
                        from = ?from,
                        size = frame.len(),
                        "Delivered frame"
                    );
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    port.overflowed.fetch_add(1, Ordering::Relaxed);
                    warn!(port = %port.name, "Reception channel full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    *port.sink.lock() = None;
                }
            }
        }
    }
}

/// A device's attachment to a [`MemoryBus`]
#[derive(Debug)]
pub struct MemoryPort {
    bus: Arc<BusInner>,
    state: Arc<PortState>,
}

impl MemoryPort {
    /// Port index on the bus
    pub fn id(&self) -> usize {
        self.state.id
    }

    /// Plug the port in or pull it out
    ///
    /// A disconnected port neither receives frames nor reaches anyone
    /// when transmitting.
    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
        debug!(port = %self.state.name, connected, "Port connection changed");
    }

    /// Whether the port is plugged in
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Frames delivered to this port's sink
    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Relaxed)
    }

    /// Times the reception pipeline was restarted
    pub fn restarts(&self) -> u64 {
        self.state.restarts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameTransport for MemoryPort {
    async fn transmit(&self, frame: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        if self.bus.line_rate == 0 {
            self.bus.carry(Some(self.state.id), frame);
            return Ok(());
        }

        let arrives = self.bus.reserve(frame.len());
        let bus = self.bus.clone();
        let from = self.state.id;
        tokio::spawn(async move {
            tokio::time::sleep_until(arrives).await;
            bus.carry(Some(from), frame);
        });
        Ok(())
    }

    fn attach_receiver(&self, sink: FrameSink) {
        *self.state.sink.lock() = Some(sink);
    }

    async fn restart_reception(&self) -> Result<()> {
        self.state.restarts.fetch_add(1, Ordering::Relaxed);
        debug!(port = %self.state.name, "Reception restarted");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.state.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_port_hears_every_frame() {
        let bus = MemoryBus::new();
        let a = bus.attach("a");
        let b = bus.attach("b");
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        a.attach_receiver(a_tx);
        b.attach_receiver(b_tx);

        let frame = wire::seal(b"\x33\x00\x00\x00\x00\x00\x00\x00\x01");
        a.transmit(frame.clone()).await.unwrap();

        // Sender hears its own echo
        assert_eq!(a_rx.recv().await.unwrap(), frame);
        assert_eq!(b_rx.recv().await.unwrap(), frame);
        assert_eq!(bus.stats().frames_carried, 1);
    }

    #[tokio::test]
    async fn test_corrupt_frames_are_dropped() {
        let bus = MemoryBus::new();
        let a = bus.attach("a");
        let (tx, mut rx) = mpsc::channel(8);
        a.attach_receiver(tx);

        let mut frame = wire::seal(b"\x33\x00\x00\x00\x00\x00\x00\x00\x01").to_vec();
        frame[2] ^= 0x40;
        bus.inject(frame);

        assert!(rx.try_recv().is_err());
        assert_eq!(bus.stats().crc_dropped, 1);
    }

    #[tokio::test]
    async fn test_disconnected_port_is_isolated() {
        let bus = MemoryBus::new();
        let a = bus.attach("a");
        let b = bus.attach("b");
        let (b_tx, mut b_rx) = mpsc::channel(8);
        b.attach_receiver(b_tx);

        b.set_connected(false);
        a.transmit(wire::seal(b"0123456789")).await.unwrap();
        assert!(b_rx.try_recv().is_err());

        assert!(matches!(
            b.transmit(wire::seal(b"0123456789")).await,
            Err(BusError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_rate_delays_and_orders_frames() {
        let bus = MemoryBus::with_line_rate(115_200);
        let a = bus.attach("a");
        let (tx, mut rx) = mpsc::channel(8);
        a.attach_receiver(tx);

        let bulk = wire::seal(&[0x33; 1509]);
        let short = wire::seal(b"\x34\x00\x00\x00\x00\x00\x00\x00\x01");
        let start = Instant::now();
        a.transmit(bulk.clone()).await.unwrap();
        a.transmit(short.clone()).await.unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(rx.recv().await.unwrap(), bulk);
        assert!(start.elapsed() >= std::time::Duration::from_millis(130));
        // The short frame queues behind the bulk one
        assert_eq!(rx.recv().await.unwrap(), short);
    }

    #[tokio::test]
    async fn test_monitor_sees_raw_traffic() {
        let bus = MemoryBus::new();
        let a = bus.attach("a");
        let mut monitor = bus.monitor();

        let frame = wire::seal(b"abcdefghij");
        a.transmit(frame.clone()).await.unwrap();
        assert_eq!(monitor.recv().await.unwrap(), frame);
        assert_eq!(a.name(), "memory:a");
    }
}
