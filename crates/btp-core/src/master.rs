//! Master role
//!
//! The master owns the bus. It discovers slaves, then polls them one at a
//! time, handing each the bus for a bounded turn.
//!
//! ```text
//! INITIAL ──► DISCOVER ──(line high)──► READY
//!    ▲          │   ▲                     │
//!    │  (line low)  │                     │ line asserted, or
//!    │          ▼   │                     │ slave past error threshold
//!    │     DISCOVER_FAILED                │
//!    └────────────────────────────────────┘
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
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
use crate::registry::{SlaveEntry, SlaveRegistry};
use crate::state::{BusState, StateCell};
use crate::status::LineLevel;
use crate::transport::BusContext;
use crate::wire::MAX_PAYLOAD_LEN;

/// What the READY loop does next
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollAction {
    /// Address a slave that has been silent too long
    KeepAlive(SlaveAddress),
    /// Deliver a queued application frame
    Deliver(OutboundFrame),
    /// Grant the next slave in round-robin order a turn
    Poll(SlaveAddress),
    /// The selected slave is lost; reset to INITIAL
    Rediscover(SlaveAddress),
    /// No slave registered
    Idle,
}

/// State shared between the master's tasks
pub(crate) struct MasterShared {
    engine: Arc<ProtocolEngine>,
    registry: Mutex<SlaveRegistry>,
    state: StateCell,
    gate: TransmitGate,
    /// Slave currently holding the bus
    awaiting: Mutex<Option<SlaveAddress>>,
    queue: FrameQueue,
    handler: Arc<dyn FrameHandler>,
    discovery_cb: Mutex<Option<DiscoveryCallback>>,
    config: BusConfig,
}

impl MasterShared {
    pub(crate) fn new(
        engine: Arc<ProtocolEngine>,
        config: BusConfig,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        Self {
            engine,
            registry: Mutex::new(SlaveRegistry::with_max_errors(config.max_slave_errors)),
            state: StateCell::new("master"),
            gate: TransmitGate::locked(),
            awaiting: Mutex::new(None),
            queue: FrameQueue::new(config.queue.capacity),
            handler,
            discovery_cb: Mutex::new(None),
            config,
        }
    }

    fn counters(&self) -> &Counters {
        self.engine.counters()
    }

    /// Pick the next READY-loop action
    ///
    /// Keep-alive beats queued traffic, which beats round-robin polling.
    pub(crate) fn next_action(&self, now: Instant) -> PollAction {
        let mut registry = self.registry.lock();

        if let Some(address) = registry.stalest(now, self.config.timing.keepalive_window) {
            return Self::unless_exhausted(&registry, address, PollAction::KeepAlive(address));
        }

        while let Some(frame) = self.queue.try_pop() {
            if registry.contains(frame.address) {
                let address = frame.address;
                return Self::unless_exhausted(&registry, address, PollAction::Deliver(frame));
            }
            warn!(address = %frame.address, size = frame.payload.len(), "Dropping frame for unregistered slave");
        }

        match registry.next_round_robin() {
            Some(address) => Self::unless_exhausted(&registry, address, PollAction::Poll(address)),
            None => PollAction::Idle,
        }
    }

    fn unless_exhausted(
        registry: &SlaveRegistry,
        address: SlaveAddress,
        action: PollAction,
    ) -> PollAction {
        if registry.is_exhausted(address) {
            PollAction::Rediscover(address)
        } else {
            action
        }
    }

    /// Hand the bus to `target` and wait for it to come back
    async fn address(&self, target: SlaveAddress, payload: &[u8]) {
        *self.awaiting.lock() = Some(target);
        self.gate.lock();

        if let Err(e) = self
            .engine
            .transmit(MessageType::AppData, target, payload)
            .await
        {
            warn!(%target, error = %e, "Failed to address slave");
        }

        let timeout = self.config.timing.ack_timeout_for(payload.len());
        if !self.gate.wait_released_for(timeout).await {
            Counters::bump(&self.counters().ack_timeouts);
            let errors = self.registry.lock().record_timeout(target);
            debug!(%target, ?errors, timeout_ms = timeout.as_millis() as u64, "No acknowledgement from slave");
        }

        *self.awaiting.lock() = None;
    }

    fn enqueue(&self, data: Bytes, destination: Option<SlaveAddress>) -> Result<()> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(BusError::FrameTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let address = match destination {
            Some(address) if address.is_broadcast() => return Err(BusError::BroadcastDestination),
            Some(address) => address,
            None => self
                .registry
                .lock()
                .most_recent()
                .ok_or(BusError::NoDestination)?,
        };

        self.queue.push(OutboundFrame::new(address, data))
    }

    fn notify_discovery_finished(&self) {
        let callback = self.discovery_cb.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl RoleBehavior for MasterShared {
    fn on_discover(&self, frame: &Frame) {
        if self.state.get() != BusState::Discover {
            debug!(address = %frame.address, "Ignoring DISCOVER outside discovery");
            return;
        }
        if self
            .registry
            .lock()
            .add_or_refresh(frame.address, Instant::now())
        {
            info!(address = %frame.address, "Slave discovered");
        }
    }

    fn on_discover_fin(&self, frame: &Frame) {
        trace!(address = %frame.address, "Ignoring DISCOVER_FIN on master");
    }

    fn on_app_data(&self, frame: &Frame) {
        let known = self
            .registry
            .lock()
            .record_success(frame.address, Instant::now());
        if !known {
            debug!(address = %frame.address, "APPDATA from unregistered slave");
        }

        if frame.has_payload() {
            Counters::bump(&self.counters().payloads_delivered);
            self.handler
                .handle_frame(Some(frame.address), frame.payload.clone());
        }
    }

    fn on_app_data_ack(&self, frame: &Frame) {
        let awaited = *self.awaiting.lock();
        if awaited != Some(frame.address) {
            debug!(address = %frame.address, ?awaited, "Unexpected APPDATA_ACK");
            return;
        }

        self.registry
            .lock()
            .record_success(frame.address, Instant::now());
        self.gate.release();
    }
}

/// Main-loop task of the master
struct MasterLoop {
    shared: Arc<MasterShared>,
    ctx: BusContext,
    failed_attempts: u32,
    /// READY was entered with the status line still asserted
    entered_low: bool,
}

impl MasterLoop {
    async fn run(mut self) {
        let mut state = BusState::Initial;
        loop {
            self.shared.state.set(state);
            state = match state {
                BusState::Initial => self.reset(),
                BusState::Discover => self.discover().await,
                BusState::DiscoverFailed => self.recover().await,
                BusState::Ready => self.serve().await,
            };
        }
    }

    fn reset(&mut self) -> BusState {
        self.shared.registry.lock().clear();
        let dropped = self.shared.queue.clear();
        if dropped > 0 {
            warn!(dropped, "Discarded queued frames on reset");
        }
        self.shared.gate.lock();
        // A turn cancelled by a status-line change must not be reopened by a late ack
        self.shared.awaiting.lock().take();
        BusState::Discover
    }

    async fn discover(&mut self) -> BusState {
        let shared = &self.shared;
        let discovery = &shared.config.discovery;
        Counters::bump(&shared.counters().discovery_cycles);

        debug!("Broadcasting DISCOVER");
        if let Err(e) = shared
            .engine
            .transmit(MessageType::Discover, SlaveAddress::BROADCAST, &[])
            .await
        {
            warn!(error = %e, "DISCOVER broadcast failed");
        }

        tokio::time::sleep(discovery.listen_period).await;

        let slaves = shared.registry.lock().addresses();
        for address in &slaves {
            if let Err(e) = shared
                .engine
                .transmit(MessageType::DiscoverFin, *address, &[])
                .await
            {
                warn!(%address, error = %e, "DISCOVER_FIN failed");
            }
            tokio::time::sleep(discovery.fin_interval).await;
        }

        tokio::time::sleep(discovery.settle_period).await;

        if self.ctx.status_line.level() == LineLevel::High {
            info!(slaves = slaves.len(), "Discovery complete");
            self.entered_low = false;
            return self.enter_ready();
        }

        self.failed_attempts += 1;
        if discovery.max_attempts > 0 && self.failed_attempts >= discovery.max_attempts {
            warn!(
                attempts = self.failed_attempts,
                slaves = slaves.len(),
                "Discovery did not converge, continuing with registered slaves"
            );
            self.entered_low = true;
            return self.enter_ready();
        }

        BusState::DiscoverFailed
    }

    fn enter_ready(&mut self) -> BusState {
        self.failed_attempts = 0;
        self.shared.state.set(BusState::Ready);
        self.shared.gate.release();
        self.shared.notify_discovery_finished();
        BusState::Ready
    }

    async fn recover(&mut self) -> BusState {
        Counters::bump(&self.shared.counters().discovery_failures);
        warn!(attempt = self.failed_attempts, "Status line still asserted, restarting reception");

        if let Err(e) = self.shared.engine.restart_reception().await {
            warn!(error = %e, "Failed to restart reception");
        }
        tokio::time::sleep(self.shared.config.discovery.retry_delay).await;
        BusState::Discover
    }

    async fn serve(&mut self) -> BusState {
        let mut line = self.ctx.status_line.subscribe();
        let mut line_open = true;
        let hold_window = self.shared.config.timing.keepalive_window;

        // Still low after a forced READY: give the bus a while, then look again.
        // Low after a clean discovery: someone joined since the settle sample.
        let mut recheck = None;
        if *line.borrow_and_update() == LineLevel::Low {
            if !self.entered_low {
                info!("Status line asserted, new device on the bus");
                return self.rediscover();
            }
            debug!(window_ms = hold_window.as_millis() as u64, "Status line held low in READY");
            recheck = Some(Instant::now() + hold_window);
        }

        loop {
            tokio::select! {
                biased;
                changed = line.changed(), if line_open => {
                    match changed {
                        Ok(()) => {
                            if *line.borrow_and_update() == LineLevel::Low {
                                info!("Status line asserted, new device on the bus");
                                return self.rediscover();
                            }
                            recheck = None;
                        }
                        Err(_) => {
                            warn!("Status line watch closed");
                            line_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep_until(recheck.unwrap_or_else(Instant::now)), if recheck.is_some() => {
                    if self.ctx.status_line.level() == LineLevel::Low {
                        info!("Status line still asserted, rediscovering");
                        return self.rediscover();
                    }
                    recheck = None;
                }
                lost = self.poll_once() => {
                    if lost {
                        return self.rediscover();
                    }
                }
            }
        }
    }

    fn rediscover(&self) -> BusState {
        Counters::bump(&self.shared.counters().rediscoveries);
        BusState::Initial
    }

    /// Run one READY iteration; returns `true` when rediscovery is needed
    async fn poll_once(&self) -> bool {
        let shared = &self.shared;
        match shared.next_action(Instant::now()) {
            PollAction::KeepAlive(address) => {
                debug!(%address, "Keep-alive poll");
                shared.address(address, &[]).await;
            }
            PollAction::Deliver(frame) => {
                shared.registry.lock().touch(frame.address, Instant::now());
                trace!(address = %frame.address, size = frame.payload.len(), "Delivering queued frame");
                shared.address(frame.address, &frame.payload).await;
            }
            PollAction::Poll(address) => {
                trace!(%address, "Poll");
                shared.address(address, &[]).await;
            }
            PollAction::Rediscover(address) => {
                warn!(%address, "Slave exceeded error threshold, rediscovering");
                return true;
            }
            PollAction::Idle => {
                tokio::time::sleep(shared.config.timing.idle_interval).await;
            }
        }
        false
    }
}

/// Entry point for the master role
#[derive(Debug)]
pub struct BusMaster;

impl BusMaster {
    /// Validate the configuration and start the master's tasks
    pub fn start(
        id: SlaveAddress,
        ctx: BusContext,
        config: BusConfig,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<MasterHandle> {
        config.validate()?;

        let engine = Arc::new(ProtocolEngine::new(ctx.transport.clone(), &config));
        let shared = Arc::new(MasterShared::new(engine.clone(), config, handler));

        info!(%id, transport = ctx.transport.name(), "Starting bus master");
        let reception = engine.spawn_reception(shared.clone());
        let main = tokio::spawn(
            MasterLoop {
                shared: shared.clone(),
                ctx,
                failed_attempts: 0,
                entered_low: false,
            }
            .run(),
        );

        Ok(MasterHandle {
            id,
            shared,
            tasks: Mutex::new(vec![reception, main]),
        })
    }
}

/// Handle for interacting with a running master
pub struct MasterHandle {
    id: SlaveAddress,
    shared: Arc<MasterShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MasterHandle {
    /// The master's own identifier
    pub fn id(&self) -> SlaveAddress {
        self.id
    }

    /// Queue application data for a slave
    ///
    /// Without a destination the slave heard from most recently is used.
    pub fn transmit_frame(
        &self,
        data: impl Into<Bytes>,
        destination: Option<SlaveAddress>,
    ) -> Result<()> {
        self.shared.enqueue(data.into(), destination)
    }

    /// Register the discovery-finished callback, replacing any previous one
    pub fn on_discovery_finished<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.discovery_cb.lock() = Some(Arc::new(callback));
    }

    /// Wait until the bus is READY
    pub async fn await_ready(&self, timeout: std::time::Duration) -> Result<()> {
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

    /// Snapshot of the slave registry
    pub fn slaves(&self) -> Vec<SlaveEntry> {
        self.shared.registry.lock().entries()
    }

    /// Frames waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> BusStats {
        self.shared.engine.stats()
    }

    /// Stop all tasks
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if !tasks.is_empty() {
            info!(id = %self.id, "Stopping bus master");
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for MasterHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("slaves", &self.shared.registry.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfigBuilder, MAX_SLAVE_ERRORS};
    use crate::status::{SharedStatusLine, StatusLine};
    use crate::transport::MemoryBus;
    use std::time::Duration;

    const A: SlaveAddress = SlaveAddress::new(0x1111_1111_1111_1111);
    const B: SlaveAddress = SlaveAddress::new(0x2222_2222_2222_2222);

    fn ignore(_: Option<SlaveAddress>, _: Bytes) {}

    fn shared_with(config: BusConfig) -> MasterShared {
        let bus = MemoryBus::new();
        let engine = Arc::new(ProtocolEngine::new(bus.attach("master"), &config));
        MasterShared::new(engine, config, Arc::new(ignore))
    }

    fn main_loop(shared: Arc<MasterShared>, line: &SharedStatusLine) -> MasterLoop {
        let bus = MemoryBus::new();
        MasterLoop {
            shared,
            ctx: BusContext::new(bus.attach("master"), Arc::new(line.tap())),
            failed_attempts: 0,
            entered_low: false,
        }
    }

    fn register(shared: &MasterShared, addresses: &[SlaveAddress], now: Instant) {
        let mut registry = shared.registry.lock();
        for address in addresses {
            registry.add_or_refresh(*address, now);
        }
    }

    #[tokio::test]
    async fn test_two_slaves_polled_once_each() {
        let shared = shared_with(BusConfig::default());
        let now = Instant::now();
        register(&shared, &[A, B], now);

        let first = shared.next_action(now);
        let second = shared.next_action(now);

        let mut polled = Vec::new();
        for action in [first, second] {
            match action {
                PollAction::Poll(address) => polled.push(address),
                other => panic!("unexpected action {other:?}"),
            }
        }
        polled.sort();
        assert_eq!(polled, vec![A, B]);
    }

    #[tokio::test]
    async fn test_keepalive_takes_precedence() {
        let shared = shared_with(BusConfig::default());
        let t0 = Instant::now();
        register(&shared, &[A, B], t0);
        shared.registry.lock().touch(B, t0 + Duration::from_millis(900));
        shared.queue.push(OutboundFrame::new(B, "queued")).unwrap();

        let action = shared.next_action(t0 + Duration::from_millis(1500));
        assert_eq!(action, PollAction::KeepAlive(A));
        // Queue untouched by the keep-alive
        assert_eq!(shared.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_beats_round_robin() {
        let shared = shared_with(BusConfig::default());
        let now = Instant::now();
        register(&shared, &[A, B], now);
        shared.queue.push(OutboundFrame::new(B, "hello")).unwrap();

        match shared.next_action(now) {
            PollAction::Deliver(frame) => {
                assert_eq!(frame.address, B);
                assert_eq!(frame.payload.as_ref(), b"hello");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frames_for_unknown_slaves_are_dropped() {
        let shared = shared_with(BusConfig::default());
        let now = Instant::now();
        register(&shared, &[A], now);
        shared.queue.push(OutboundFrame::new(B, "lost")).unwrap();

        assert_eq!(shared.next_action(now), PollAction::Poll(A));
        assert!(shared.queue.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_slave_triggers_rediscovery() {
        let shared = shared_with(BusConfig::default());
        let now = Instant::now();
        register(&shared, &[A], now);

        for _ in 0..=MAX_SLAVE_ERRORS {
            shared.registry.lock().record_timeout(A);
        }

        assert_eq!(shared.next_action(now), PollAction::Rediscover(A));
    }

    #[tokio::test]
    async fn test_idle_without_slaves() {
        let shared = shared_with(BusConfig::default());
        assert_eq!(shared.next_action(Instant::now()), PollAction::Idle);
    }

    #[tokio::test]
    async fn test_discover_only_registers_during_discovery() {
        let shared = shared_with(BusConfig::default());
        let reply = Frame::control(MessageType::Discover, A);

        shared.on_discover(&reply);
        assert!(shared.registry.lock().is_empty());

        shared.state.set(BusState::Discover);
        shared.on_discover(&reply);
        shared.on_discover(&Frame::control(MessageType::Discover, SlaveAddress::BROADCAST));
        assert_eq!(shared.registry.lock().addresses(), vec![A]);
    }

    #[tokio::test]
    async fn test_ack_releases_only_for_awaited_slave() {
        let shared = shared_with(BusConfig::default());
        register(&shared, &[A, B], Instant::now());
        *shared.awaiting.lock() = Some(A);

        shared.on_app_data_ack(&Frame::control(MessageType::AppDataAck, B));
        assert!(!shared.gate.is_released());

        shared.on_app_data_ack(&Frame::control(MessageType::AppDataAck, A));
        assert!(shared.gate.is_released());
    }

    #[tokio::test]
    async fn test_reset_forgets_cancelled_turn() {
        let shared = Arc::new(shared_with(BusConfig::default()));
        let line = SharedStatusLine::new();
        register(&shared, &[A], Instant::now());
        // Turn in progress when the status line interrupted READY
        *shared.awaiting.lock() = Some(A);

        let mut main = main_loop(shared.clone(), &line);
        assert_eq!(main.reset(), BusState::Discover);

        shared.on_app_data_ack(&Frame::control(MessageType::AppDataAck, A));
        assert!(!shared.gate.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_low_on_entering_ready_rediscovers() {
        let shared = Arc::new(shared_with(BusConfig::default()));
        let line = SharedStatusLine::new();
        let joiner = line.tap();
        joiner.set_attention(true);

        let mut main = main_loop(shared.clone(), &line);
        assert_eq!(main.serve().await, BusState::Initial);
        assert_eq!(shared.engine.stats().rediscoveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_held_after_forced_ready_rechecked() {
        let config = BusConfig::default();
        let window = config.timing.keepalive_window;
        let shared = Arc::new(shared_with(config));
        let line = SharedStatusLine::new();
        let stuck = line.tap();
        stuck.set_attention(true);

        let mut main = main_loop(shared.clone(), &line);
        main.entered_low = true;
        let started = Instant::now();
        assert_eq!(main.serve().await, BusState::Initial);
        assert!(started.elapsed() >= window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_released_after_forced_ready_keeps_serving() {
        let shared = Arc::new(shared_with(BusConfig::default()));
        let line = SharedStatusLine::new();
        let stuck = line.tap();
        stuck.set_attention(true);

        let mut main = main_loop(shared.clone(), &line);
        main.entered_low = true;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stuck.set_attention(false);
        });

        let served = tokio::time::timeout(Duration::from_secs(3), main.serve()).await;
        assert!(served.is_err());
        assert_eq!(shared.engine.stats().rediscoveries, 0);
    }

    #[tokio::test]
    async fn test_app_data_is_delivered_with_sender() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = BusConfig::default();
        let bus = MemoryBus::new();
        let engine = Arc::new(ProtocolEngine::new(bus.attach("master"), &config));
        let shared = MasterShared::new(
            engine,
            config,
            Arc::new(move |sender: Option<SlaveAddress>, data: Bytes| {
                sink.lock().push((sender, data));
            }),
        );

        shared.on_app_data(&Frame::new(MessageType::AppData, A, Bytes::from_static(b"temp=21")));
        shared.on_app_data(&Frame::control(MessageType::AppData, A));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Some(A));
        assert_eq!(seen[0].1.as_ref(), b"temp=21");
    }

    #[tokio::test]
    async fn test_enqueue_destinations() {
        let shared = shared_with(BusConfigBuilder::new().queue_capacity(1).build());

        assert!(matches!(
            shared.enqueue(Bytes::from_static(b"x"), None),
            Err(BusError::NoDestination)
        ));
        assert!(matches!(
            shared.enqueue(Bytes::from_static(b"x"), Some(SlaveAddress::BROADCAST)),
            Err(BusError::BroadcastDestination)
        ));

        let t0 = Instant::now();
        register(&shared, &[A], t0);
        register(&shared, &[B], t0 + Duration::from_millis(1));
        shared.enqueue(Bytes::from_static(b"x"), None).unwrap();
        assert_eq!(shared.queue.try_pop().map(|f| f.address), Some(B));

        shared.enqueue(Bytes::from_static(b"1"), Some(A)).unwrap();
        assert!(matches!(
            shared.enqueue(Bytes::from_static(b"2"), Some(A)),
            Err(BusError::QueueFull { capacity: 1 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let shared = shared_with(BusConfig::default());
        let data = Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            shared.enqueue(data, Some(A)),
            Err(BusError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_poll_counts_timeout() {
        let config = BusConfig::default();
        let bus = MemoryBus::new();
        let engine = Arc::new(ProtocolEngine::new(bus.attach("master"), &config));
        let shared = Arc::new(MasterShared::new(engine.clone(), config, Arc::new(ignore)));
        let _rx = engine.spawn_reception(shared.clone());
        register(&shared, &[A], Instant::now());

        shared.address(A, &[]).await;

        assert_eq!(shared.registry.lock().get(A).unwrap().error_count, 1);
        assert_eq!(shared.engine.stats().ack_timeouts, 1);
        assert!(shared.awaiting.lock().is_none());
    }
}
