//! Error types reported by the download engine.

use thiserror::Error;

use crate::image::{FwVersion, ImageError};
use crate::protocol::{CrcStatus, DlStatus, FrameError};
use crate::timer::TimerError;
use crate::transport::TransportError;

/// Outcome of a command, delivered synchronously (start failures) or through
/// the completion callback.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Another download command is in progress")]
    Busy,

    #[error("No response within the response timeout")]
    Timeout,

    /// The controller reported a PLL error while writing.
    #[error("Write failed: controller reported PLL error")]
    WriteFailed,

    /// The controller rejected the image signature.
    #[error("Write rejected: signature mismatch")]
    Rejected,

    /// Major version mismatch, or the firmware is already up to date.
    #[error("Firmware version error")]
    FwVersionError,

    #[error("Command failed: {0}")]
    Failed(#[from] Failure),
}

/// Reason behind a generic command failure.
#[derive(Error, Debug)]
pub enum Failure {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("unexpected device status {0}")]
    UnexpectedStatus(DlStatus),

    #[error("read returned {actual} bytes, requested {expected}")]
    ShortRead { expected: usize, actual: usize },

    #[error("response payload of {len} bytes exceeds buffer of {capacity}")]
    ResponseOverflow { len: usize, capacity: usize },

    #[error("device still busy after {0} resends")]
    ResendLimit(u32),

    #[error("integrity check failed: {0}")]
    Integrity(CrcStatus),

    #[error("unexpected {what} report: {detail}")]
    BadReport { what: &'static str, detail: String },

    #[error("firmware version {expected} not running after download, device reports {actual}")]
    VersionMismatch { expected: FwVersion, actual: FwVersion },

    #[error("session ended without delivering a completion")]
    Abandoned,
}

impl DownloadError {
    /// Check whether this failure originates from a status the recovery
    /// selector acts on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DownloadError::WriteFailed | DownloadError::Rejected)
    }
}

macro_rules! failure_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for DownloadError {
            fn from(e: $ty) -> Self {
                DownloadError::Failed(Failure::from(e))
            }
        })*
    };
}

failure_from!(FrameError, TransportError, TimerError, ImageError);
