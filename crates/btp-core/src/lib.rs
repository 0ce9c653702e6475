//! Bus Transceiver Protocol (BTP)
//!
//! A master/slave protocol for a two-wire party-line bus. One master
//! discovers the slaves on the bus, keeps a registry of them, and polls them
//! round-robin; each slave may only transmit during the turn the master
//! grants it.
//!
//! # Architecture
//!
//! The crate is layered bottom-up:
//!
//! 1. **Wire** - frame layout, CRC-32 trailer, serial stream framing
//! 2. **Transport** - [`FrameTransport`] implementations (in-memory, serial)
//!    plus the [`StatusLine`] attention signal
//! 3. **Engine** - [`ProtocolEngine`]: transmit buffer, flush with echo
//!    confirmation, echo suppression, dispatch to a [`RoleBehavior`]
//! 4. **Roles** - [`BusMaster`] and [`BusSlave`] state machines, driven
//!    through [`MasterHandle`] / [`SlaveHandle`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use btp_core::{
//!     BusConfig, BusContext, BusMaster, BusSlave, MemoryBus, RecordingHandler,
//!     SharedStatusLine, SlaveAddress,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> btp_core::Result<()> {
//!     let bus = MemoryBus::new();
//!     let line = SharedStatusLine::new();
//!
//!     let master = BusMaster::start(
//!         SlaveAddress::new(0),
//!         BusContext::new(bus.attach("master"), Arc::new(line.tap())),
//!         BusConfig::default(),
//!         Arc::new(RecordingHandler::new()),
//!     )?;
//!     let slave = BusSlave::start(
//!         SlaveAddress::new(0x42),
//!         BusContext::new(bus.attach("slave"), Arc::new(line.tap())),
//!         BusConfig::default(),
//!         Arc::new(RecordingHandler::new()),
//!     )?;
//!
//!     master.await_ready(Duration::from_secs(5)).await?;
//!     slave.transmit_frame("temperature=21.5")?;
//!     Ok(())
//! }
//! ```
//!
//! # Frame Layout
//!
//! ```text
//! +------+----------------+-----------------+-------------+
//! | type | address (u64)  | payload         | crc32 (LE)  |
//! +------+----------------+-----------------+-------------+
//!   1 B    8 B, LE          0..n B            4 B
//! ```
//!
//! | Type          | Code | Address field            |
//! |---------------|------|--------------------------|
//! | DISCOVER      | 0x31 | broadcast or own address |
//! | DISCOVER_FIN  | 0x32 | registered slave         |
//! | APPDATA       | 0x33 | target / sending slave   |
//! | APPDATA_ACK   | 0x34 | acknowledging slave      |
//!
//! # Features
//!
//! - `serial` - Serial port transport and RTS/CTS status line
//!   (requires `libudev-dev` on Linux)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Wire format
pub mod config;
pub mod error;
pub mod frame;
pub mod wire;

// Hardware seams
pub mod status;
pub mod transport;

// Protocol core
pub mod engine;
pub mod gate;
pub mod handler;
pub mod queue;
pub mod registry;
pub mod state;

// Roles
pub mod master;
pub mod slave;

// Testing utilities
pub mod test_utils;

pub use config::{BusConfig, BusConfigBuilder, DiscoveryConfig, QueueConfig, TimingConfig};
pub use error::{BusError, Result};
pub use frame::{Frame, MessageType, SlaveAddress};

pub use status::{LineLevel, SharedStatusLine, StatusLine, StatusLineTap};
#[cfg(feature = "serial")]
pub use status::modem::ModemStatusLine;
pub use transport::{BusContext, FrameSink, FrameTransport, MemoryBus, MemoryBusStats, MemoryPort};
#[cfg(feature = "serial")]
pub use transport::SerialTransport;

pub use engine::{BusStats, ProtocolEngine, RoleBehavior};
pub use gate::TransmitGate;
pub use handler::{ChannelHandler, DiscoveryCallback, FrameHandler, ReceivedFrame};
pub use queue::{FrameQueue, OutboundFrame};
pub use registry::{SlaveEntry, SlaveRegistry};
pub use state::BusState;

pub use master::{BusMaster, MasterHandle};
pub use slave::{BusSlave, SlaveHandle};

pub use test_utils::{BusFixture, RecordingHandler};

// Protocol constants re-exports
pub use config::{BULK_PAYLOAD_THRESHOLD, DEFAULT_BAUD_RATE, MAX_SLAVE_ERRORS};
pub use frame::MIN_FRAME_LEN;
pub use wire::{CRC_LEN, MAX_PAYLOAD_LEN};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(MIN_FRAME_LEN, 9);
        assert_eq!(CRC_LEN, 4);
        assert_eq!(MAX_SLAVE_ERRORS, 10);
        assert_eq!(BULK_PAYLOAD_THRESHOLD, 1000);
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
    }

    #[test]
    fn test_message_codes() {
        assert_eq!(MessageType::Discover.as_u8(), 0x31);
        assert_eq!(MessageType::DiscoverFin.as_u8(), 0x32);
        assert_eq!(MessageType::AppData.as_u8(), 0x33);
        assert_eq!(MessageType::AppDataAck.as_u8(), 0x34);
    }
}
