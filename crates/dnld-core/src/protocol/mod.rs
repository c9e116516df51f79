//! Protocol module - download-mode wire definitions.

pub mod clock;
pub mod constants;
pub mod frame;
pub mod integrity;
pub mod status;

pub use clock::{ClockFrequency, ClockSource, force_payload};
pub use constants::*;
pub use frame::{CRC16, Frame, FrameBuffer, FrameError, crc16, decode, encode};
pub use integrity::{CrcRegion, CrcStatus};
pub use status::DlStatus;
