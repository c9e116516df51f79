//! DnLd-Core: firmware download engine for PN54x NFC controllers.
//!
//! This crate drives the controller's download-mode command protocol:
//! CRC-checked frames, chunked reads and writes, response and resend
//! timers, and recovery image selection after hardware-reported failures.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, status codes, frame codec
//! - **Transport**: Asynchronous byte transport abstraction (mock, simulator)
//! - **Timer**: Timer service abstraction (thread-backed, manual)
//! - **Image**: Download images, loaders, recovery selection
//! - **State**: Session state machine, chunker and response handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Engine**: Command facade and event dispatch
//! - **Sequence**: Full download with version checks, logging and recovery
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use dnld_core::config::EngineConfig;
//! use dnld_core::engine::DownloadEngine;
//! use dnld_core::timer::ThreadTimerService;
//! use dnld_core::transport::SimulatedController;
//!
//! let config = EngineConfig::default();
//! let loader = config.image_loader();
//! let mut engine = DownloadEngine::new(
//!     SimulatedController::default(),
//!     ThreadTimerService::new(),
//!     loader,
//!     config,
//! );
//!
//! engine
//!     .get_version(vec![0; 11], |done| println!("{:?}", done.response))
//!     .expect("start failed");
//! engine.wait_idle(Duration::from_secs(3));
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod image;
pub mod protocol;
pub mod sequence;
pub mod state;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use config::{ChipType, EngineConfig};
pub use engine::{Completion, DownloadEngine};
pub use error::{DownloadError, Failure};
pub use events::{DnldEvent, DnldObserver, LogLevel, NullObserver, TracingObserver};
pub use image::{FirmwareImage, FwVersion, ImageKind, ImageLoader};
pub use protocol::{ClockFrequency, ClockSource, CrcStatus, DlStatus};
pub use sequence::{DownloadLog, DownloadSequencer, SequenceOptions, SequenceReport};
pub use state::{Command, SessionState};
pub use timer::{ManualTimerService, ThreadTimerService, TimerService};
pub use transport::{DeviceMode, MockTransport, SimulatedController, Transport, TransportError};
