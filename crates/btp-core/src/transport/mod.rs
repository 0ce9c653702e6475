//! Frame transports
//!
//! The protocol engine only needs "send a sealed frame" and "get told about
//! every valid frame on the bus". Implementations:
//!
//! - [`memory::MemoryBus`] - in-process party-line bus (tests, simulation)
//! - [`serial::SerialTransport`] - serial port (requires `serial` feature)
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

pub mod memory;

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

pub use memory::{MemoryBus, MemoryBusStats, MemoryPort};

use crate::error::Result;
use crate::status::StatusLine;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a transport delivers received frames
///
/// Frames are sealed (CRC trailer attached) and already CRC-checked.
pub type FrameSink = mpsc::Sender<Bytes>;

/// Trait for bus frame transports
///
/// The bus is a party line: a transport must deliver the device's own
/// transmissions back through the sink, exactly like any other frame.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Put a sealed frame on the bus
    ///
    /// Resolves once the transmission has completed.
    async fn transmit(&self, frame: Bytes) -> Result<()>;

    /// Register the sink for received frames
    ///
    /// Replaces any previously attached sink. Delivery must never block the
    /// transport; frames that do not fit the sink are dropped.
    fn attach_receiver(&self, sink: FrameSink);

    /// Restart the reception pipeline, discarding partial input
    async fn restart_reception(&self) -> Result<()>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// Hardware a role runs on
///
/// Passed in at construction; the protocol holds no global device state.
#[derive(Clone)]
pub struct BusContext {
    /// Frame transport
    pub transport: Arc<dyn FrameTransport>,
    /// This device's connection to the status line
    pub status_line: Arc<dyn StatusLine>,
}

impl BusContext {
    /// Bundle a transport and a status line
    pub fn new(transport: Arc<dyn FrameTransport>, status_line: Arc<dyn StatusLine>) -> Self {
        Self {
            transport,
            status_line,
        }
    }
}

impl std::fmt::Debug for BusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusContext")
            .field("transport", &self.transport.name())
            .field("status_line", &self.status_line.level())
            .finish()
    }
}
