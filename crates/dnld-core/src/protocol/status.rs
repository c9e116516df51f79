//! Device status codes.
//!
//! Every response frame carries a one-byte status right after the length
//! header. This module gives those bytes names and classifies them.

use std::fmt;

/// Status byte reported by the controller in a response frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum DlStatus {
    Ok,
    InvalidAddr,
    UnknownCmd,
    AbortedCmd,
    PllError,
    AddrRangeOverflow,
    BufferOverflow,
    MemBusy,
    SignatureError,
    FirmwareVersionError,
    ProtocolError,
    SfwuDegraded,
    /// First fragment of a segmented record accepted.
    FirstChunkAck,
    /// Further fragment of a segmented record accepted.
    NextChunkAck,
    InternalError5,
    /// Any byte not listed above.
    Unknown(u8),
}

impl DlStatus {
    /// Parse a status byte.
    pub const fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::Ok,
            0x01 => Self::InvalidAddr,
            0x0B => Self::UnknownCmd,
            0x0C => Self::AbortedCmd,
            0x0D => Self::PllError,
            0x1E => Self::AddrRangeOverflow,
            0x1F => Self::BufferOverflow,
            0x20 => Self::MemBusy,
            0x21 => Self::SignatureError,
            0x24 => Self::FirmwareVersionError,
            0x28 => Self::ProtocolError,
            0x2A => Self::SfwuDegraded,
            0x2D => Self::FirstChunkAck,
            0x2E => Self::NextChunkAck,
            0xC5 => Self::InternalError5,
            other => Self::Unknown(other),
        }
    }

    /// Raw status byte.
    pub const fn as_byte(&self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::InvalidAddr => 0x01,
            Self::UnknownCmd => 0x0B,
            Self::AbortedCmd => 0x0C,
            Self::PllError => 0x0D,
            Self::AddrRangeOverflow => 0x1E,
            Self::BufferOverflow => 0x1F,
            Self::MemBusy => 0x20,
            Self::SignatureError => 0x21,
            Self::FirmwareVersionError => 0x24,
            Self::ProtocolError => 0x28,
            Self::SfwuDegraded => 0x2A,
            Self::FirstChunkAck => 0x2D,
            Self::NextChunkAck => 0x2E,
            Self::InternalError5 => 0xC5,
            Self::Unknown(b) => *b,
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidAddr => "INVALID_ADDR",
            Self::UnknownCmd => "UNKNOWN_CMD",
            Self::AbortedCmd => "ABORTED_CMD",
            Self::PllError => "PLL_ERROR",
            Self::AddrRangeOverflow => "ADDR_RANGE_OFL",
            Self::BufferOverflow => "BUFFER_OFL",
            Self::MemBusy => "MEM_BSY",
            Self::SignatureError => "SIGNATURE_ERROR",
            Self::FirmwareVersionError => "FIRMWARE_VERSION_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::SfwuDegraded => "SFWU_DEGRADED",
            Self::FirstChunkAck => "FIRST_FRAGFRAME_RESP",
            Self::NextChunkAck => "NEXT_FRAGFRAME_RESP",
            Self::InternalError5 => "INTERNAL_ERROR_5",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Check if this status acknowledges a frame (full or fragment).
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ok | Self::FirstChunkAck | Self::NextChunkAck)
    }

    /// Check if this status is a hardware failure that selects a recovery image.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PllError | Self::SignatureError)
    }
}

impl From<u8> for DlStatus {
    fn from(b: u8) -> Self {
        Self::from_byte(b)
    }
}

impl fmt::Debug for DlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DlStatus({:02X} '{}')", self.as_byte(), self.name())
    }
}

impl fmt::Display for DlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.as_byte())
    }
}
