//! Wire-level framing: CRC-32 trailer and serial stream sync
//!
//! Every frame on the bus carries a 4-byte little-endian CRC-32 trailer
//! computed over the frame body. On byte-stream transports (serial) each
//! sealed frame is additionally prefixed with a sync word and a length:
//!
//! ```text
//! +-----------+------------+----------------+-------------+
//! | 0xB7 0x5A | len (u16)  | body           | crc32 (LE)  |
//! +-----------+------------+----------------+-------------+
//!                 big-endian  len = body + 4
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{BusError, Result};
use crate::frame::MIN_FRAME_LEN;

/// CRC-32 (polynomial 0x04C11DB7, table driven)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Length of the CRC trailer
pub const CRC_LEN: usize = 4;

/// Smallest sealed frame that can hold a protocol header
pub const MIN_WIRE_LEN: usize = MIN_FRAME_LEN + CRC_LEN;

/// Stream sync word
pub const SYNC_WORD: [u8; 2] = [0xB7, 0x5A];

/// Stream header length (sync + length)
pub const STREAM_HEADER_LEN: usize = 4;

/// Largest sealed frame accepted on a byte stream
pub const MAX_WIRE_FRAME: usize = 4096;

/// Largest application payload that still fits in one sealed frame
pub const MAX_PAYLOAD_LEN: usize = MAX_WIRE_FRAME - MIN_FRAME_LEN - CRC_LEN;

/// Compute the CRC-32 of `data`
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Append the CRC trailer to a frame body
pub fn seal(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + CRC_LEN);
    buf.put_slice(body);
    buf.put_u32_le(checksum(body));
    buf.freeze()
}

/// Check the CRC trailer of a sealed frame
pub fn verify(wire: &[u8]) -> Result<()> {
    if wire.len() < CRC_LEN {
        return Err(BusError::FrameTooShort {
            len: wire.len(),
            min: CRC_LEN,
        });
    }

    let (body, trailer) = wire.split_at(wire.len() - CRC_LEN);
    let got = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let expected = checksum(body);

    if got != expected {
        return Err(BusError::CrcMismatch { expected, got });
    }
    Ok(())
}

/// Body of a sealed frame (trailer removed)
pub fn strip(wire: &[u8]) -> &[u8] {
    &wire[..wire.len().saturating_sub(CRC_LEN)]
}

/// Bits on the line per byte (8N1: start, 8 data, stop)
pub const BITS_PER_BYTE: u64 = 10;

/// Time a frame of `stream_len` bytes occupies a line running at `line_rate` baud
///
/// A zero rate means an instantaneous line.
pub fn transfer_time(stream_len: usize, line_rate: u32) -> Duration {
    if line_rate == 0 {
        return Duration::ZERO;
    }
    let bits = stream_len as u64 * BITS_PER_BYTE;
    Duration::from_micros(bits.saturating_mul(1_000_000).div_ceil(u64::from(line_rate)))
}

/// Prefix a sealed frame with the stream header
pub fn encode_stream(sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() > MAX_WIRE_FRAME {
        return Err(BusError::FrameTooLarge {
            size: sealed.len(),
            max: MAX_WIRE_FRAME,
        });
    }

    let mut out = Vec::with_capacity(STREAM_HEADER_LEN + sealed.len());
    out.extend_from_slice(&SYNC_WORD);
    out.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    out.extend_from_slice(sealed);
    Ok(out)
}

/// Incremental decoder for the serial byte stream
///
/// Yields sealed frames (trailer still attached) whose CRC checks out.
/// Corrupt frames are dropped here and never reach the protocol engine.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    crc_failures: u64,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_WIRE_FRAME),
            crc_failures: 0,
        }
    }

    /// Feed raw bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop any partially received frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Frames discarded because of a CRC mismatch
    pub fn crc_failures(&self) -> u64 {
        self.crc_failures
    }

    /// Try to take the next valid frame from the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversized length
    /// field is reported as an error after skipping the bad sync word.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.buffer.len() < STREAM_HEADER_LEN {
                return Ok(None);
            }

            if self.buffer[..2] != SYNC_WORD {
                self.resync();
                continue;
            }

            let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;

            if length > MAX_WIRE_FRAME || length < CRC_LEN {
                warn!(length, "Frame length out of range, likely corrupt");
                self.buffer.advance(2);
                return Err(BusError::InvalidFrame(format!(
                    "stream length {} out of range",
                    length
                )));
            }

            let total = STREAM_HEADER_LEN + length;
            if self.buffer.len() < total {
                trace!(
                    have = self.buffer.len(),
                    need = total,
                    "Waiting for complete frame"
                );
                return Ok(None);
            }

            let mut frame = self.buffer.split_to(total);
            frame.advance(STREAM_HEADER_LEN);
            let sealed = frame.freeze();

            match verify(&sealed) {
                Ok(()) => {
                    debug!(size = sealed.len(), "Received complete frame");
                    return Ok(Some(sealed));
                }
                Err(e) => {
                    self.crc_failures += 1;
                    debug!(error = %e, "Dropping frame with bad CRC");
                }
            }
        }
    }

    /// Discard bytes up to the next sync word candidate
    fn resync(&mut self) {
        match self.find_sync() {
            Some(pos) => {
                warn!(discarded = pos, "Discarding bytes before sync word");
                self.buffer.advance(pos);
            }
            None => {
                // Keep a trailing first sync byte, it may be completed by the next read
                let keep = usize::from(self.buffer.last() == Some(&SYNC_WORD[0]));
                let discard = self.buffer.len() - keep;
                if discard > 0 {
                    warn!(discarded = discard, "Discarding buffer without sync word");
                    self.buffer.advance(discard);
                }
            }
        }
    }

    fn find_sync(&self) -> Option<usize> {
        self.buffer
            .windows(2)
            .position(|w| w == SYNC_WORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_verify() {
        let sealed = seal(b"\x33\x01\x02\x03\x04\x05\x06\x07\x08");
        assert_eq!(sealed.len(), 13);
        verify(&sealed).unwrap();
        assert_eq!(strip(&sealed), b"\x33\x01\x02\x03\x04\x05\x06\x07\x08");
    }

    #[test]
    fn test_known_checksum() {
        // Standard CRC-32 check value
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut sealed = seal(b"hello bus").to_vec();
        sealed[3] ^= 0x01;
        assert!(matches!(verify(&sealed), Err(BusError::CrcMismatch { .. })));
    }

    #[test]
    fn test_decoder_complete_frame() {
        let sealed = seal(b"frame body");
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_stream(&sealed).unwrap());

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame, sealed);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_partial_frame() {
        let stream = encode_stream(&seal(b"frame body")).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&stream[..6]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 6);

        decoder.extend(&stream[6..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_decoder_skips_garbage() {
        let sealed = seal(b"payload");
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"noise");
        decoder.extend(&encode_stream(&sealed).unwrap());

        assert_eq!(decoder.next_frame().unwrap().unwrap(), sealed);
    }

    #[test]
    fn test_decoder_drops_bad_crc_and_continues() {
        let mut bad = encode_stream(&seal(b"first")).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = seal(b"second");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bad);
        decoder.extend(&encode_stream(&good).unwrap());

        assert_eq!(decoder.next_frame().unwrap().unwrap(), good);
        assert_eq!(decoder.crc_failures(), 1);
    }

    #[test]
    fn test_decoder_rejects_oversized_length() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xB7, 0x5A, 0xFF, 0xFF]);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_transfer_time() {
        // 1513 sealed bytes plus header at 115200 baud
        let bulk = transfer_time(1513 + STREAM_HEADER_LEN, 115_200);
        assert!(bulk > Duration::from_millis(130));
        assert!(bulk < Duration::from_millis(133));

        assert_eq!(transfer_time(100, 1_000_000), Duration::from_millis(1));
        assert_eq!(transfer_time(4096, 0), Duration::ZERO);
    }

    #[test]
    fn test_encode_stream_rejects_large_frames() {
        let big = vec![0u8; MAX_WIRE_FRAME + 1];
        assert!(matches!(
            encode_stream(&big),
            Err(BusError::FrameTooLarge { .. })
        ));
    }
}
