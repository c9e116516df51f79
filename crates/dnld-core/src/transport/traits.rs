//! Byte transport abstraction.
//!
//! Defines the `Transport` trait for the link to the NFC controller,
//! allowing different implementations (device node, mock, simulator).
//! Writes and reads are asynchronous: the call only queues the request and
//! the outcome arrives later through the supplied completion handle.

use std::fmt;

use thiserror::Error;

use crate::dispatch::{ReadCompletion, WriteCompletion};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Read already pending")]
    ReadPending,

    #[error("Mode switch to {mode} failed: {message}")]
    ModeSwitchFailed { mode: DeviceMode, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operating mode of the controller, toggled through its VEN/firmware-download lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Normal NCI operation.
    Normal,
    /// Firmware download (bootloader) mode.
    Download,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Normal => write!(f, "NORMAL"),
            DeviceMode::Download => write!(f, "DOWNLOAD"),
        }
    }
}

/// Abstract transport to the controller.
///
/// Completion handles may be resolved on any thread, including inside the
/// call itself.
pub trait Transport: Send + Sync {
    /// Queue `frame` for transmission. `Err` means the request was not accepted
    /// and `done` will never fire.
    fn write(&self, frame: &[u8], done: WriteCompletion) -> Result<(), TransportError>;

    /// Queue a read of up to `max_len` bytes.
    fn read(&self, max_len: usize, done: ReadCompletion) -> Result<(), TransportError>;

    /// Cancel the outstanding read, if any. Its completion is dropped.
    fn abort_read(&self);

    /// Switch the controller between normal and download mode.
    fn set_mode(&self, mode: DeviceMode) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn write(&self, frame: &[u8], done: WriteCompletion) -> Result<(), TransportError> {
        (**self).write(frame, done)
    }

    fn read(&self, max_len: usize, done: ReadCompletion) -> Result<(), TransportError> {
        (**self).read(max_len, done)
    }

    fn abort_read(&self) {
        (**self).abort_read()
    }

    fn set_mode(&self, mode: DeviceMode) -> Result<(), TransportError> {
        (**self).set_mode(mode)
    }
}
