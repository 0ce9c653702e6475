//! Protocol frames
//!
//! Layout after the transport has verified and stripped the CRC trailer:
//!
//! ```text
//! +------+-------------------------+----------------+
//! | type | address (8 bytes)       | payload (opt.) |
//! +------+-------------------------+----------------+
//!   0      1..=8                     9..
//! ```
//!
//! The address is an opaque token compared for equality only. It is written
//! little-endian so two devices of different endianness still agree on it.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{BusError, Result};

/// Length of the message type tag
pub const TYPE_LEN: usize = 1;

/// Length of the address field
pub const ADDRESS_LEN: usize = 8;

/// Smallest valid protocol frame (type + address)
pub const MIN_FRAME_LEN: usize = TYPE_LEN + ADDRESS_LEN;

/// Wire message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Discovery request (master, broadcast) or reply (slave, own address)
    Discover = 0x31,
    /// Registration confirmation for one slave
    DiscoverFin = 0x32,
    /// Application data, or a bare poll when the payload is empty
    AppData = 0x33,
    /// Slave hands the bus back to the master
    AppDataAck = 0x34,
}

impl MessageType {
    /// Wire value of this type
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = BusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x31 => Ok(MessageType::Discover),
            0x32 => Ok(MessageType::DiscoverFin),
            0x33 => Ok(MessageType::AppData),
            0x34 => Ok(MessageType::AppDataAck),
            other => Err(BusError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Discover => write!(f, "DISCOVER"),
            MessageType::DiscoverFin => write!(f, "DISCOVER_FIN"),
            MessageType::AppData => write!(f, "APPDATA"),
            MessageType::AppDataAck => write!(f, "APPDATA_ACK"),
        }
    }
}

/// 64-bit slave identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlaveAddress(u64);

impl SlaveAddress {
    /// Reserved all-ones broadcast address
    pub const BROADCAST: SlaveAddress = SlaveAddress(u64::MAX);

    /// Wrap a raw identifier
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is the broadcast address
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Wire representation
    pub fn to_bytes(self) -> [u8; ADDRESS_LEN] {
        self.0.to_le_bytes()
    }

    /// Read from wire representation
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl From<u64> for SlaveAddress {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SlaveAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl std::str::FromStr for SlaveAddress {
    type Err = BusError;

    /// Accepts decimal or `0x`-prefixed hexadecimal
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => s.replace('_', "").parse::<u64>(),
        };
        parsed
            .map(SlaveAddress)
            .map_err(|e| BusError::InvalidConfig(format!("invalid slave address '{}': {}", s, e)))
    }
}

/// A parsed protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type
    pub kind: MessageType,
    /// Destination (master → slave) or sender (slave → master)
    pub address: SlaveAddress,
    /// Application payload, empty for polls and control frames
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(kind: MessageType, address: SlaveAddress, payload: Bytes) -> Self {
        Self {
            kind,
            address,
            payload,
        }
    }

    /// Create a frame without payload
    pub fn control(kind: MessageType, address: SlaveAddress) -> Self {
        Self::new(kind, address, Bytes::new())
    }

    /// Whether the frame carries application data
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Encoded length
    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.payload.len()
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        encode_parts(buf, self.kind, self.address, &self.payload);
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse a frame body (CRC trailer already removed)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_FRAME_LEN {
            return Err(BusError::FrameTooShort {
                len: data.len(),
                min: MIN_FRAME_LEN,
            });
        }

        let kind = message_type(data)?;
        let address = address(data)?;
        let payload = Bytes::copy_from_slice(&data[MIN_FRAME_LEN..]);

        Ok(Self {
            kind,
            address,
            payload,
        })
    }
}

/// Append type, address and payload to `buf`
pub fn encode_parts(buf: &mut BytesMut, kind: MessageType, address: SlaveAddress, payload: &[u8]) {
    buf.reserve(MIN_FRAME_LEN + payload.len());
    buf.put_u8(kind.as_u8());
    buf.put_slice(&address.to_bytes());
    buf.put_slice(payload);
}

/// Message type at offset 0
pub fn message_type(data: &[u8]) -> Result<MessageType> {
    let tag = *data.first().ok_or(BusError::FrameTooShort {
        len: 0,
        min: MIN_FRAME_LEN,
    })?;
    MessageType::try_from(tag)
}

/// Address at offset 1
pub fn address(data: &[u8]) -> Result<SlaveAddress> {
    let bytes: [u8; ADDRESS_LEN] = data
        .get(TYPE_LEN..MIN_FRAME_LEN)
        .and_then(|s| s.try_into().ok())
        .ok_or(BusError::FrameTooShort {
            len: data.len(),
            min: MIN_FRAME_LEN,
        })?;
    Ok(SlaveAddress::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::AppData.as_u8(), 0x33);
        assert_eq!(MessageType::AppDataAck.as_u8(), 0x34);
        assert_ne!(MessageType::Discover.as_u8(), MessageType::DiscoverFin.as_u8());
        assert!(matches!(
            MessageType::try_from(0x00),
            Err(BusError::UnknownMessageType(0x00))
        ));
    }

    #[test]
    fn test_frame_layout() {
        let addr = SlaveAddress::new(0x0102030405060708);
        let frame = Frame::new(MessageType::AppData, addr, Bytes::from_static(b"hi"));
        let bytes = frame.to_bytes();

        assert_eq!(bytes.len(), 11);
        assert_eq!(bytes[0], 0x33);
        assert_eq!(&bytes[1..9], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[9..], b"hi");
    }

    #[test]
    fn test_parse_recovers_frame() {
        let cases = [
            Frame::control(MessageType::Discover, SlaveAddress::BROADCAST),
            Frame::control(MessageType::DiscoverFin, SlaveAddress::new(42)),
            Frame::new(
                MessageType::AppData,
                SlaveAddress::new(0x1111_1111_1111_1111),
                Bytes::from(vec![0u8; 1500]),
            ),
            Frame::control(MessageType::AppDataAck, SlaveAddress::new(0)),
        ];

        for frame in cases {
            let parsed = Frame::parse(&frame.to_bytes()).unwrap();
            assert_eq!(parsed, frame);
        }
    }

    #[test]
    fn test_parse_rejects_short_frames() {
        for len in 0..MIN_FRAME_LEN {
            let data = vec![0x33u8; len];
            let err = Frame::parse(&data).unwrap_err();
            assert!(matches!(err, BusError::FrameTooShort { min: 9, .. }));
        }
    }

    #[test]
    fn test_accessors() {
        let frame = Frame::control(MessageType::DiscoverFin, SlaveAddress::new(7));
        let bytes = frame.to_bytes();
        assert_eq!(message_type(&bytes).unwrap(), MessageType::DiscoverFin);
        assert_eq!(address(&bytes).unwrap(), SlaveAddress::new(7));
        assert!(address(&bytes[..5]).is_err());
    }

    #[test]
    fn test_address_parsing_and_display() {
        let addr: SlaveAddress = "0x2222_2222_2222_2222".parse().unwrap();
        assert_eq!(addr.raw(), 0x2222_2222_2222_2222);
        assert_eq!(addr.to_string(), "0x2222222222222222");
        assert_eq!("17".parse::<SlaveAddress>().unwrap(), SlaveAddress::new(17));
        assert!("0xZZ".parse::<SlaveAddress>().is_err());
        assert!(SlaveAddress::new(u64::MAX).is_broadcast());
    }
}
