//! Error types for bus transceiver operations
//!
//! Covers the transport seam (serial/in-memory), frame parsing, the outbound
//! queue, and role lifecycle. Most protocol faults never surface here: the
//! state machines recover from them locally and only log.

use thiserror::Error;

/// Main error type for bus transceiver operations
#[derive(Error, Debug)]
pub enum BusError {
    // ===== Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Transport write error
    #[error("Transport write error: {0}")]
    WriteError(String),

    /// Transport read error
    #[error("Transport read error: {0}")]
    ReadError(String),

    /// Transport detached from the bus
    #[error("Transport disconnected")]
    Disconnected,

    /// Transmit completion not confirmed in time
    #[error("Write timeout after {duration_ms}ms")]
    WriteTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Own frame not observed on the receive path in time
    #[error("Echo timeout after {duration_ms}ms")]
    EchoTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Protocol Errors =====
    /// Frame shorter than the protocol header
    #[error("Frame too short: {len} bytes, minimum is {min}")]
    FrameTooShort {
        /// Received length
        len: usize,
        /// Minimum accepted length
        min: usize,
    },

    /// Unknown message type tag
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// CRC trailer mismatch
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{got:08X}")]
    CrcMismatch {
        /// CRC computed over the body
        expected: u32,
        /// CRC carried in the trailer
        got: u32,
    },

    /// Invalid frame on the byte stream
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame exceeds the transport maximum
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Queue Errors =====
    /// Outbound queue is at capacity
    #[error("Transmit queue full ({capacity} frames)")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
    },

    /// No destination given and none could be chosen
    #[error("No destination slave available")]
    NoDestination,

    /// Destination is the broadcast address
    #[error("Broadcast address cannot be used as a destination")]
    BroadcastDestination,

    // ===== State Errors =====
    /// READY was not reached in time
    #[error("Bus not ready after {duration_ms}ms")]
    ReadyTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Role task is no longer running
    #[error("Bus role is not running")]
    NotRunning,

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BusError::WriteTimeout { .. }
                | BusError::EchoTimeout { .. }
                | BusError::WriteError(_)
                | BusError::ReadError(_)
                | BusError::QueueFull { .. }
                | BusError::ReadyTimeout { .. }
        )
    }

    /// Check if this is a protocol error (bad data on the bus)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            BusError::FrameTooShort { .. }
                | BusError::UnknownMessageType(_)
                | BusError::CrcMismatch { .. }
                | BusError::InvalidFrame(_)
                | BusError::FrameTooLarge { .. }
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            BusError::PortNotFound(_) => "PORT_NOT_FOUND",
            BusError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BusError::WriteError(_) => "WRITE_ERROR",
            BusError::ReadError(_) => "READ_ERROR",
            BusError::Disconnected => "DISCONNECTED",
            BusError::WriteTimeout { .. } => "WRITE_TIMEOUT",
            BusError::EchoTimeout { .. } => "ECHO_TIMEOUT",
            BusError::FrameTooShort { .. } => "FRAME_TOO_SHORT",
            BusError::UnknownMessageType(_) => "UNKNOWN_MESSAGE_TYPE",
            BusError::CrcMismatch { .. } => "CRC_MISMATCH",
            BusError::InvalidFrame(_) => "INVALID_FRAME",
            BusError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            BusError::QueueFull { .. } => "QUEUE_FULL",
            BusError::NoDestination => "NO_DESTINATION",
            BusError::BroadcastDestination => "BROADCAST_DESTINATION",
            BusError::ReadyTimeout { .. } => "READY_TIMEOUT",
            BusError::NotRunning => "NOT_RUNNING",
            BusError::InvalidConfig(_) => "INVALID_CONFIG",
            BusError::ChannelError(_) => "CHANNEL_ERROR",
            BusError::ChannelClosed => "CHANNEL_CLOSED",
            BusError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for BusError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => BusError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                BusError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BusError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BusError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BusError::ChannelError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = BusError::PortNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(BusError::QueueFull { capacity: 4 }.error_code(), "QUEUE_FULL");
    }

    #[test]
    fn test_is_retriable() {
        assert!(BusError::EchoTimeout { duration_ms: 50 }.is_retriable());
        assert!(BusError::QueueFull { capacity: 8 }.is_retriable());
        assert!(!BusError::UnknownMessageType(0x99).is_retriable());
        assert!(!BusError::Disconnected.is_retriable());
    }

    #[test]
    fn test_is_protocol_error() {
        assert!(BusError::FrameTooShort { len: 3, min: 9 }.is_protocol_error());
        assert!(BusError::CrcMismatch {
            expected: 1,
            got: 2
        }
        .is_protocol_error());
        assert!(!BusError::NoDestination.is_protocol_error());
    }

    #[test]
    fn test_crc_mismatch_display() {
        let err = BusError::CrcMismatch {
            expected: 0xDEADBEEF,
            got: 0x12345678,
        };
        assert!(err.to_string().contains("0xDEADBEEF"));
        assert!(err.to_string().contains("0x12345678"));
    }
}
