//! Clock configuration carried by the Force command.

use super::constants::DEFAULT_FORCE_PAYLOAD;

/// PLL input frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockFrequency {
    Mhz13,
    #[default]
    Mhz19_2,
    Mhz24,
    Mhz26,
    Mhz38_4,
    Mhz52,
}

impl ClockFrequency {
    pub const fn code(&self) -> u8 {
        match self {
            ClockFrequency::Mhz13 => 0,
            ClockFrequency::Mhz19_2 => 1,
            ClockFrequency::Mhz24 => 2,
            ClockFrequency::Mhz26 => 3,
            ClockFrequency::Mhz38_4 => 4,
            ClockFrequency::Mhz52 => 5,
        }
    }
}

/// System clock source of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Xtal,
    Pll(ClockFrequency),
    PadDirect,
}

impl ClockSource {
    pub const fn code(&self) -> u8 {
        match self {
            ClockSource::Xtal => 1,
            ClockSource::Pll(_) => 2,
            ClockSource::PadDirect => 3,
        }
    }

    /// First Force payload byte: `(source << 3) | frequency`.
    ///
    /// Only the PLL takes a frequency; the other sources encode zero.
    pub const fn encode(&self) -> u8 {
        let freq = match self {
            ClockSource::Pll(f) => f.code(),
            _ => 0,
        };
        (self.code() << 3) | freq
    }
}

/// Three-byte Force payload for `clock`, or the default when none is given.
pub fn force_payload(clock: Option<ClockSource>) -> [u8; 3] {
    match clock {
        Some(src) => [src.encode(), 0x00, 0x00],
        None => DEFAULT_FORCE_PAYLOAD,
    }
}
