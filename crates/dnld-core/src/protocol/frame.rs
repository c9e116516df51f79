//! Download frame codec.
//!
//! Wire layout of every non-raw frame:
//!
//! ```text
//! [len_hi len_lo] [id/status] [payload ...] [crc_hi crc_lo]
//! ```
//!
//! The big-endian length counts the id/status byte plus the payload. Bit 10
//! of the length flags that more fragments of the same record follow. The
//! CRC16 trailer covers every byte before it, exactly as transmitted.

use byteorder::{BigEndian, ByteOrder};
use crc::{CRC_16_IBM_3740, Crc};
use thiserror::Error;

use super::constants::{
    FRAG_BIT, FRAME_CRC_LEN, FRAME_HDR_LEN, FRAME_ID_OFFSET, LEN_MASK, MAX_FRAME_BODY,
    MAX_FRAME_SIZE,
};
use super::status::DlStatus;

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no xor-out.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Smallest valid frame: header, one id/status byte and the CRC.
pub const MIN_FRAME_LEN: usize = FRAME_HDR_LEN + 1 + FRAME_CRC_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {actual} bytes, minimum {minimum}")]
    TooShort { actual: usize, minimum: usize },

    #[error("Frame body of {len} bytes exceeds maximum {max}")]
    BodyTooLarge { len: usize, max: usize },

    #[error("Frame body is empty")]
    EmptyBody,

    #[error("Raw frame of {len} bytes exceeds buffer size {max}")]
    RawTooLarge { len: usize, max: usize },

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Length mismatch: header declares {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Compute the frame CRC16 over `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Fixed-capacity buffer holding one outgoing frame.
#[derive(Clone)]
pub struct FrameBuffer {
    data: [u8; MAX_FRAME_SIZE],
    len: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            data: [0; MAX_FRAME_SIZE],
            len: 0,
        }
    }

    /// Encode `id` + `payload` into the buffer.
    pub fn encode(&mut self, id: u8, payload: &[u8], more: bool) -> Result<(), FrameError> {
        let body_len = 1 + payload.len();
        if body_len > MAX_FRAME_BODY {
            return Err(FrameError::BodyTooLarge {
                len: body_len,
                max: MAX_FRAME_BODY,
            });
        }
        self.data[FRAME_ID_OFFSET] = id;
        self.data[FRAME_ID_OFFSET + 1..FRAME_ID_OFFSET + body_len].copy_from_slice(payload);
        self.seal(body_len, more);
        Ok(())
    }

    /// Encode a body whose first byte is already the frame id.
    pub fn encode_body(&mut self, body: &[u8], more: bool) -> Result<(), FrameError> {
        match body.split_first() {
            Some((&id, payload)) => self.encode(id, payload, more),
            None => Err(FrameError::EmptyBody),
        }
    }

    /// Store a raw frame verbatim, without header or CRC.
    pub fn set_raw(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(FrameError::RawTooLarge {
                len: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    fn seal(&mut self, body_len: usize, more: bool) {
        let mut header = body_len as u16;
        if more {
            header |= FRAG_BIT;
        }
        BigEndian::write_u16(&mut self.data[..FRAME_HDR_LEN], header);
        let crc_at = FRAME_HDR_LEN + body_len;
        let crc = crc16(&self.data[..crc_at]);
        BigEndian::write_u16(&mut self.data[crc_at..crc_at + FRAME_CRC_LEN], crc);
        self.len = crc_at + FRAME_CRC_LEN;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.len)
            .field("data", &self.as_bytes())
            .finish()
    }
}

impl PartialEq for FrameBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for FrameBuffer {}

/// Encode a frame into a fresh vector.
pub fn encode(id: u8, payload: &[u8], more: bool) -> Result<Vec<u8>, FrameError> {
    let mut buf = FrameBuffer::new();
    buf.encode(id, payload, more)?;
    Ok(buf.as_bytes().to_vec())
}

/// A validated frame borrowed from a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Frame id (requests) or status (responses).
    pub code: u8,
    /// Bytes between the id/status byte and the CRC.
    pub payload: &'a [u8],
    /// Fragmentation bit from the length header.
    pub more: bool,
}

impl Frame<'_> {
    /// Interpret the code byte as a device status.
    pub fn status(&self) -> DlStatus {
        DlStatus::from_byte(self.code)
    }
}

/// Validate CRC and length of a received frame.
pub fn decode(raw: &[u8]) -> Result<Frame<'_>, FrameError> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort {
            actual: raw.len(),
            minimum: MIN_FRAME_LEN,
        });
    }

    let crc_at = raw.len() - FRAME_CRC_LEN;
    let expected = crc16(&raw[..crc_at]);
    let actual = BigEndian::read_u16(&raw[crc_at..]);
    if expected != actual {
        return Err(FrameError::CrcMismatch { expected, actual });
    }

    let header = BigEndian::read_u16(&raw[..FRAME_HDR_LEN]);
    let declared = (header & LEN_MASK) as usize;
    let carried = crc_at - FRAME_HDR_LEN;
    if declared != carried {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: carried,
        });
    }

    Ok(Frame {
        code: raw[FRAME_ID_OFFSET],
        payload: &raw[FRAME_ID_OFFSET + 1..crc_at],
        more: header & FRAG_BIT != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_crc_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_get_version_frame() {
        let frame = encode(CMD_GET_VERSION, &[0, 0, 0], false).unwrap();
        assert_eq!(frame, vec![0x00, 0x04, 0xF1, 0x00, 0x00, 0x00, 0x6E, 0xEF]);
    }

    #[test]
    fn test_reset_frame() {
        let frame = encode(CMD_RESET, &[0, 0, 0], false).unwrap();
        assert_eq!(&frame[6..], &[0x18, 0x5B]);
    }

    #[test]
    fn test_roundtrip_all_payload_lengths() {
        for len in 0..MAX_FRAME_BODY {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let raw = encode(0x5A, &payload, false).unwrap();
            assert_eq!(raw.len(), len + MIN_FRAME_LEN);

            let frame = decode(&raw).unwrap();
            assert_eq!(frame.code, 0x5A);
            assert_eq!(frame.payload, payload.as_slice());
            assert!(!frame.more);
        }
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let raw = encode(CMD_WRITE, &[1, 2, 3, 4, 5, 6, 7, 8], false).unwrap();
        for i in 0..raw.len() {
            for bit in 0..8 {
                let mut bad = raw.clone();
                bad[i] ^= 1 << bit;
                assert!(decode(&bad).is_err(), "flip at byte {} bit {}", i, bit);
            }
        }
    }

    #[test]
    fn test_frag_bit_covered_by_crc() {
        let with = encode(CMD_WRITE, &[0xAA; 10], true).unwrap();
        let without = encode(CMD_WRITE, &[0xAA; 10], false).unwrap();
        assert_eq!(with[0] & 0x04, 0x04);
        assert_ne!(&with[with.len() - 2..], &without[without.len() - 2..]);

        let frame = decode(&with).unwrap();
        assert!(frame.more);
        assert_eq!(frame.payload.len(), 10);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        // Header claims 5 bytes, frame carries 4; CRC recomputed so only length is wrong
        let mut raw = vec![0x00, 0x05, 0x00, 0x01, 0x02, 0x03];
        let crc = crc16(&raw);
        raw.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(
            decode(&raw),
            Err(FrameError::LengthMismatch {
                declared: 5,
                actual: 4
            })
        );
    }

    #[test]
    fn test_too_short_rejected() {
        assert!(matches!(
            decode(&[0x00, 0x01, 0x00, 0x00]),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_body_limits() {
        let mut buf = FrameBuffer::new();
        assert!(buf.encode(CMD_WRITE, &[0; MAX_FRAME_BODY - 1], false).is_ok());
        assert_eq!(buf.len(), MAX_FRAME_SIZE);
        assert!(matches!(
            buf.encode(CMD_WRITE, &[0; MAX_FRAME_BODY], false),
            Err(FrameError::BodyTooLarge { .. })
        ));
        assert_eq!(buf.encode_body(&[], false), Err(FrameError::EmptyBody));
    }

    #[test]
    fn test_raw_bypasses_framing() {
        let mut buf = FrameBuffer::new();
        buf.set_raw(&[0xDE, 0xAD]).unwrap();
        assert_eq!(buf.as_bytes(), &[0xDE, 0xAD]);
        assert!(buf.set_raw(&[0; MAX_FRAME_SIZE + 1]).is_err());
    }
}
