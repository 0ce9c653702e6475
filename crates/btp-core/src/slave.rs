//! Slave role
//!
//! A slave is reactive. It answers discovery, then speaks only when the
//! master addresses it, for at most one active window per turn.
//!
//! Tasks:
//! - reception: engine dispatch into [`RoleBehavior`]
//! - discovery responder: randomized DISCOVER reply
//! - transmitter: drains the outbound queue during a granted turn

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::BusConfig;
use crate::engine::{BusStats, Counters, ProtocolEngine, RoleBehavior};
use crate::error::{BusError, Result};
use crate::frame::{Frame, MessageType, SlaveAddress};
use crate::gate::TransmitGate;
use crate::handler::{DiscoveryCallback, FrameHandler};
use crate::queue::{FrameQueue, OutboundFrame};
use crate::state::{BusState, StateCell};
use crate::status::StatusLine;
use crate::transport::BusContext;
use crate::wire::MAX_PAYLOAD_LEN;

/// State shared between the slave's tasks
pub(crate) struct SlaveShared {
    address: SlaveAddress,
    engine: Arc<ProtocolEngine>,
    status_line: Arc<dyn StatusLine>,
    state: StateCell,
    gate: TransmitGate,
    queue: FrameQueue,
    handler: Arc<dyn FrameHandler>,
    discovery_cb: Mutex<Option<DiscoveryCallback>>,
    /// Wakes the discovery responder
    discover_tx: mpsc::Sender<()>,
    activity: AtomicU64,
    config: BusConfig,
}

impl SlaveShared {
    fn new(
        address: SlaveAddress,
        engine: Arc<ProtocolEngine>,
        status_line: Arc<dyn StatusLine>,
        config: BusConfig,
        handler: Arc<dyn FrameHandler>,
    ) -> (Self, mpsc::Receiver<()>) {
        let (discover_tx, discover_rx) = mpsc::channel(1);
        let shared = Self {
            address,
            engine,
            status_line,
            state: StateCell::new("slave"),
            gate: TransmitGate::locked(),
            queue: FrameQueue::new(config.queue.capacity),
            handler,
            discovery_cb: Mutex::new(None),
            discover_tx,
            activity: AtomicU64::new(0),
            config,
        };
        (shared, discover_rx)
    }

    /// Enter INITIAL and signal presence on the status line
    fn reset(&self) {
        self.state.set(BusState::Initial);
        self.queue.clear();
        self.gate.lock();
        self.status_line.set_attention(true);
    }

    fn enqueue(&self, data: Bytes) -> Result<()> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(BusError::FrameTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        self.queue.push(OutboundFrame::new(self.address, data))
    }

    fn notify_discovery_finished(&self) {
        let callback = self.discovery_cb.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Reply to a broadcast DISCOVER after a random delay
    async fn answer_discovery(&self, mut events: mpsc::Receiver<()>) {
        while events.recv().await.is_some() {
            let delay = random_delay(self.config.discovery.response_window());
            trace!(address = %self.address, delay_ms = delay.as_millis() as u64, "Scheduling DISCOVER reply");
            tokio::time::sleep(delay).await;

            // A newer DISCOVER during the delay is answered by this reply
            while events.try_recv().is_ok() {}

            if self.state.get() != BusState::Discover {
                continue;
            }
            if let Err(e) = self
                .engine
                .transmit(MessageType::Discover, self.address, &[])
                .await
            {
                warn!(address = %self.address, error = %e, "DISCOVER reply failed");
            }
        }
    }

    /// Serve transmission turns granted by the master
    async fn serve_turns(&self) {
        let timing = &self.config.timing;
        loop {
            self.gate.wait_released().await;
            let deadline = Instant::now() + timing.active_window;

            loop {
                if self.state.get() != BusState::Ready {
                    self.gate.lock();
                    break;
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    trace!(address = %self.address, "Active window elapsed");
                    self.end_turn().await;
                    break;
                }

                match self.queue.pop_timeout(remaining.min(timing.queue_wait)).await {
                    Some(frame) => {
                        if let Err(e) = self
                            .engine
                            .transmit(MessageType::AppData, self.address, &frame.payload)
                            .await
                        {
                            warn!(address = %self.address, error = %e, "Failed to send queued frame");
                        }
                    }
                    None => {
                        self.end_turn().await;
                        break;
                    }
                }
            }
        }
    }

    /// Lock, then hand the bus back with a bare acknowledgement
    async fn end_turn(&self) {
        // Locking first keeps a poll that follows the ack from being lost
        self.gate.lock();
        if let Err(e) = self
            .engine
            .transmit(MessageType::AppDataAck, self.address, &[])
            .await
        {
            warn!(address = %self.address, error = %e, "Failed to acknowledge turn");
        }
    }
}

fn random_delay(window: Duration) -> Duration {
    let micros = window.as_micros() as u64;
    if micros == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::thread_rng().gen_range(0..micros))
}

impl RoleBehavior for SlaveShared {
    fn on_discover(&self, frame: &Frame) {
        if !frame.address.is_broadcast() {
            trace!(peer = %frame.address, "Ignoring DISCOVER reply from peer");
            return;
        }

        debug!(address = %self.address, "Discovery started by master");
        self.state.set(BusState::Discover);
        self.queue.clear();
        self.gate.lock();
        self.status_line.set_attention(true);

        // Full means a reply is already pending
        let _ = self.discover_tx.try_send(());
    }

    fn on_discover_fin(&self, frame: &Frame) {
        if frame.address != self.address {
            return;
        }
        if self.state.get() != BusState::Discover {
            debug!(address = %self.address, "DISCOVER_FIN outside discovery");
            return;
        }

        self.status_line.set_attention(false);
        self.state.set(BusState::Ready);
        info!(address = %self.address, "Registered with master");
        self.notify_discovery_finished();
    }

    fn on_app_data(&self, frame: &Frame) {
        if frame.address != self.address || self.state.get() != BusState::Ready {
            return;
        }

        if frame.has_payload() {
            Counters::bump(&self.engine.counters().payloads_delivered);
            self.activity.fetch_add(1, Ordering::Relaxed);
            self.handler.handle_frame(None, frame.payload.clone());
        }
        self.gate.release();
    }

    fn on_app_data_ack(&self, frame: &Frame) {
        trace!(peer = %frame.address, "Ignoring APPDATA_ACK on slave");
    }
}

/// Entry point for the slave role
#[derive(Debug)]
pub struct BusSlave;

impl BusSlave {
    /// Validate the configuration and start the slave's tasks
    pub fn start(
        address: SlaveAddress,
        ctx: BusContext,
        config: BusConfig,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<SlaveHandle> {
        if address.is_broadcast() {
            return Err(BusError::InvalidConfig(
                "slave address must not be the broadcast address".to_string(),
            ));
        }
        config.validate()?;

        let engine = Arc::new(ProtocolEngine::new(ctx.transport.clone(), &config));
        let (shared, discover_rx) =
            SlaveShared::new(address, engine.clone(), ctx.status_line, config, handler);
        let shared = Arc::new(shared);
        shared.reset();

        info!(%address, transport = ctx.transport.name(), "Starting bus slave");
        let reception = engine.spawn_reception(shared.clone());

        let responder = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.answer_discovery(discover_rx).await })
        };
        let transmitter = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.serve_turns().await })
        };

        Ok(SlaveHandle {
            shared,
            tasks: Mutex::new(vec![reception, responder, transmitter]),
        })
    }
}

/// Handle for interacting with a running slave
pub struct SlaveHandle {
    shared: Arc<SlaveShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SlaveHandle {
    /// Own bus address
    pub fn address(&self) -> SlaveAddress {
        self.shared.address
    }

    /// Queue application data for the master
    pub fn transmit_frame(&self, data: impl Into<Bytes>) -> Result<()> {
        self.shared.enqueue(data.into())
    }

    /// Register the discovery-finished callback, replacing any previous one
    pub fn on_discovery_finished<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.discovery_cb.lock() = Some(Arc::new(callback));
    }

    /// Wait until registered with the master
    pub async fn await_ready(&self, timeout: Duration) -> Result<()> {
        self.shared.state.await_ready(timeout).await
    }

    /// Current state
    pub fn state(&self) -> BusState {
        self.shared.state.get()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<BusState> {
        self.shared.state.subscribe()
    }

    /// Number of payloads received from the master
    pub fn activity(&self) -> u64 {
        self.shared.activity.load(Ordering::Relaxed)
    }

    /// Frames waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> BusStats {
        self.shared.engine.stats()
    }

    /// Stop all tasks and release the status line
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        info!(address = %self.shared.address, "Stopping bus slave");
        for task in tasks {
            task.abort();
        }
        self.shared.status_line.set_attention(false);
    }
}

impl Drop for SlaveHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SlaveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveHandle")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{LineLevel, SharedStatusLine};
    use crate::transport::MemoryBus;

    const ME: SlaveAddress = SlaveAddress::new(0xABCD);
    const OTHER: SlaveAddress = SlaveAddress::new(0x1234);

    fn ignore(_: Option<SlaveAddress>, _: Bytes) {}

    fn shared_on(line: &SharedStatusLine) -> (SlaveShared, mpsc::Receiver<()>) {
        let config = BusConfig::default();
        let bus = MemoryBus::new();
        let engine = Arc::new(ProtocolEngine::new(bus.attach("slave"), &config));
        SlaveShared::new(ME, engine, Arc::new(line.tap()), config, Arc::new(ignore))
    }

    #[test]
    fn test_random_delay_bounds() {
        let window = Duration::from_millis(800);
        for _ in 0..100 {
            assert!(random_delay(window) < window);
        }
        assert_eq!(random_delay(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_reset_asserts_line() {
        let line = SharedStatusLine::new();
        let (shared, _rx) = shared_on(&line);
        shared.queue.push(OutboundFrame::new(ME, "stale")).unwrap();

        shared.reset();

        assert_eq!(line.level(), LineLevel::Low);
        assert!(shared.queue.is_empty());
        assert!(!shared.gate.is_released());
    }

    #[test]
    fn test_discovery_handshake() {
        let line = SharedStatusLine::new();
        let (shared, mut rx) = shared_on(&line);
        let finished = Arc::new(AtomicU64::new(0));
        let counter = finished.clone();
        *shared.discovery_cb.lock() = Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // Peer replies do not start discovery
        shared.on_discover(&Frame::control(MessageType::Discover, OTHER));
        assert_eq!(shared.state.get(), BusState::Initial);

        shared.on_discover(&Frame::control(MessageType::Discover, SlaveAddress::BROADCAST));
        assert_eq!(shared.state.get(), BusState::Discover);
        assert_eq!(line.level(), LineLevel::Low);
        assert!(rx.try_recv().is_ok());

        // FIN for someone else is ignored
        shared.on_discover_fin(&Frame::control(MessageType::DiscoverFin, OTHER));
        assert_eq!(shared.state.get(), BusState::Discover);

        shared.on_discover_fin(&Frame::control(MessageType::DiscoverFin, ME));
        assert_eq!(shared.state.get(), BusState::Ready);
        assert_eq!(line.level(), LineLevel::High);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_app_data_releases_turn() {
        let line = SharedStatusLine::new();
        let (shared, _rx) = shared_on(&line);

        // Not READY: ignored
        shared.on_app_data(&Frame::control(MessageType::AppData, ME));
        assert!(!shared.gate.is_released());

        shared.state.set(BusState::Ready);
        shared.on_app_data(&Frame::control(MessageType::AppData, OTHER));
        assert!(!shared.gate.is_released());

        shared.on_app_data(&Frame::control(MessageType::AppData, ME));
        assert!(shared.gate.is_released());
        assert_eq!(shared.activity.load(Ordering::Relaxed), 0);

        shared.on_app_data(&Frame::new(MessageType::AppData, ME, Bytes::from_static(b"cmd")));
        assert_eq!(shared.activity.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_ends_with_ack() {
        let line = SharedStatusLine::new();
        let config = BusConfig::default();
        let bus = MemoryBus::new();
        let mut monitor = bus.monitor();
        let engine = Arc::new(ProtocolEngine::new(bus.attach("slave"), &config));
        let (shared, _rx) =
            SlaveShared::new(ME, engine.clone(), Arc::new(line.tap()), config, Arc::new(ignore));
        let shared = Arc::new(shared);
        let _reception = engine.spawn_reception(shared.clone());

        shared.state.set(BusState::Ready);
        shared.enqueue(Bytes::from_static(b"reading")).unwrap();
        shared.gate.release();

        let turn = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.serve_turns().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        turn.abort();

        let data = Frame::parse(crate::wire::strip(&monitor.recv().await.unwrap())).unwrap();
        assert_eq!(data.kind, MessageType::AppData);
        assert_eq!(data.address, ME);
        assert_eq!(data.payload.as_ref(), b"reading");

        let ack = Frame::parse(crate::wire::strip(&monitor.recv().await.unwrap())).unwrap();
        assert_eq!(ack.kind, MessageType::AppDataAck);
        assert!(!shared.gate.is_released());
    }

    #[tokio::test]
    async fn test_broadcast_address_rejected() {
        let bus = MemoryBus::new();
        let line = SharedStatusLine::new();
        let ctx = BusContext::new(bus.attach("slave"), Arc::new(line.tap()));
        let err = BusSlave::start(
            SlaveAddress::BROADCAST,
            ctx,
            BusConfig::default(),
            Arc::new(ignore),
        )
        .unwrap_err();
        assert!(matches!(err, BusError::InvalidConfig(_)));
    }
}
