//! Test fixtures for running a whole bus in-process
//!
//! [`BusFixture`] wires a master and any number of slaves onto one
//! [`MemoryBus`] sharing one [`SharedStatusLine`]. Combined with
//! `#[tokio::test(start_paused = true)]` a full discovery cycle runs in
//! virtual time.
//!
//! # Example
//!
//! ```rust,ignore
//! use btp_core::test_utils::BusFixture;
//! use std::time::Duration;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_discovery() {
//!     let fixture = BusFixture::new(3).unwrap();
//!     fixture.await_all_ready(Duration::from_secs(5)).await.unwrap();
//!     assert_eq!(fixture.registered().len(), 3);
//! }
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BusConfig, BusConfigBuilder};
use crate::error::Result;
use crate::frame::SlaveAddress;
use crate::handler::{FrameHandler, ReceivedFrame};
use crate::master::{BusMaster, MasterHandle};
use crate::slave::{BusSlave, SlaveHandle};
use crate::status::SharedStatusLine;
use crate::transport::{BusContext, MemoryBus, MemoryPort};

/// Address prefix used for fixture slaves
const FIXTURE_ADDRESS_BASE: u64 = 0x0B70_0000_0000_0000;

/// Master identifier used by fixtures
pub const FIXTURE_MASTER_ID: SlaveAddress = SlaveAddress::new(0x0B70_0000_0000_0000);

/// Address of the `index`-th fixture slave
pub fn fixture_slave_address(index: usize) -> SlaveAddress {
    SlaveAddress::new(FIXTURE_ADDRESS_BASE | (index as u64 + 1))
}

/// Configuration with a short discovery cycle
pub fn fast_config() -> BusConfig {
    BusConfigBuilder::new()
        .listen_period(Duration::from_millis(200))
        .response_margin(Duration::from_millis(50))
        .settle_period(Duration::from_millis(20))
        .build()
}

/// Frame handler that records everything it receives
#[derive(Debug, Default)]
pub struct RecordingHandler {
    frames: Mutex<Vec<ReceivedFrame>>,
}

impl RecordingHandler {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far
    pub fn frames(&self) -> Vec<ReceivedFrame> {
        self.frames.lock().clone()
    }

    /// Payloads received so far
    pub fn payloads(&self) -> Vec<Bytes> {
        self.frames.lock().iter().map(|f| f.data.clone()).collect()
    }

    /// Number of frames received
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether nothing was received
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Wait until at least `count` frames arrived; returns whether they did
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.len() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }
}

impl FrameHandler for RecordingHandler {
    fn handle_frame(&self, sender: Option<SlaveAddress>, data: Bytes) {
        self.frames.lock().push(ReceivedFrame { sender, data });
    }
}

/// One slave on a fixture bus
#[derive(Debug)]
pub struct SlaveNode {
    /// Running slave
    pub handle: SlaveHandle,
    /// Its bus attachment, for disconnect simulation
    pub port: Arc<MemoryPort>,
    /// Payloads the slave received
    pub inbox: Arc<RecordingHandler>,
}

/// A master and its slaves on one in-memory bus
#[derive(Debug)]
pub struct BusFixture {
    /// The shared wire
    pub bus: MemoryBus,
    /// The shared status line
    pub line: SharedStatusLine,
    /// Running master
    pub master: MasterHandle,
    /// The master's bus attachment
    pub master_port: Arc<MemoryPort>,
    /// Payloads the master received
    pub master_inbox: Arc<RecordingHandler>,
    /// Running slaves, in start order
    pub slaves: Vec<SlaveNode>,
    config: BusConfig,
}

impl BusFixture {
    /// Start a master and `slaves` slaves with [`fast_config`]
    pub fn new(slaves: usize) -> Result<Self> {
        Self::with_config(slaves, fast_config())
    }

    /// Start a master and `slaves` slaves with a custom configuration
    pub fn with_config(slaves: usize, config: BusConfig) -> Result<Self> {
        Self::on_bus(MemoryBus::new(), slaves, config)
    }

    /// Start a master and `slaves` slaves on an existing bus
    pub fn on_bus(bus: MemoryBus, slaves: usize, config: BusConfig) -> Result<Self> {
        let line = SharedStatusLine::new();

        let master_port = bus.attach("master");
        let master_inbox = Arc::new(RecordingHandler::new());
        let master = BusMaster::start(
            FIXTURE_MASTER_ID,
            BusContext::new(master_port.clone(), Arc::new(line.tap())),
            config.clone(),
            master_inbox.clone(),
        )?;

        let mut fixture = Self {
            bus,
            line,
            master,
            master_port,
            master_inbox,
            slaves: Vec::with_capacity(slaves),
            config,
        };
        for _ in 0..slaves {
            fixture.add_slave()?;
        }
        Ok(fixture)
    }

    /// Start one more slave on the bus
    pub fn add_slave(&mut self) -> Result<&SlaveNode> {
        let address = fixture_slave_address(self.slaves.len());
        let port = self.bus.attach(format!("slave-{address}"));
        let inbox = Arc::new(RecordingHandler::new());
        let handle = BusSlave::start(
            address,
            BusContext::new(port.clone(), Arc::new(self.line.tap())),
            self.config.clone(),
            inbox.clone(),
        )?;

        self.slaves.push(SlaveNode {
            handle,
            port,
            inbox,
        });
        let index = self.slaves.len() - 1;
        Ok(&self.slaves[index])
    }

    /// Wait until the master and every slave are READY
    pub async fn await_all_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.master.await_ready(timeout).await?;
        for slave in &self.slaves {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            slave.handle.await_ready(remaining).await?;
        }
        Ok(())
    }

    /// Addresses in the master's registry, sorted
    pub fn registered(&self) -> Vec<SlaveAddress> {
        let mut addresses: Vec<_> = self.master.slaves().iter().map(|e| e.address).collect();
        addresses.sort();
        addresses
    }

    /// Addresses of all fixture slaves, sorted
    pub fn slave_addresses(&self) -> Vec<SlaveAddress> {
        let mut addresses: Vec<_> = self.slaves.iter().map(|s| s.handle.address()).collect();
        addresses.sort();
        addresses
    }

    /// Stop every role
    pub fn shutdown(&self) {
        for slave in &self.slaves {
            slave.handle.shutdown();
        }
        self.master.shutdown();
    }
}
