//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends and tests to follow a download session without
//! tight coupling to the engine.

use std::fmt;

use crate::protocol::DlStatus;
use crate::state::{Command, SessionState};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Controller
    Rx, // Controller -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the download engine.
#[derive(Debug, Clone)]
pub enum DnldEvent {
    /// A command was accepted and its session started.
    CommandStarted { command: Command },
    /// Session state machine transition.
    StateChanged { from: SessionState, to: SessionState },
    /// Frame written or received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Status byte of a validated response.
    StatusReceived { status: DlStatus },
    /// Bytes transferred so far in a read or write.
    Progress {
        command: Command,
        current: u64,
        total: u64,
    },
    /// Controller was busy; the last frame will be sent again.
    Resend { attempt: u32 },
    /// No response before the response timer expired.
    Timeout { command: Command },
    /// Controller toggled through normal mode after a signature error.
    VenReset,
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Session finished; `error` is `None` on success.
    Finished {
        command: Command,
        error: Option<String>,
    },
}

/// Observer trait for receiving download events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DnldObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DnldEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DnldObserver for NullObserver {
    fn on_event(&self, _event: &DnldEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DnldObserver for TracingObserver {
    fn on_event(&self, event: &DnldEvent) {
        match event {
            DnldEvent::CommandStarted { command } => {
                tracing::info!(command = %command, "Command started");
            }
            DnldEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State transition");
            }
            DnldEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "Frame");
            }
            DnldEvent::StatusReceived { status } => {
                tracing::debug!(status = %status, "Status received");
            }
            DnldEvent::Progress {
                command,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(command = %command, progress = %format!("{}%", pct), "Progress");
            }
            DnldEvent::Resend { attempt } => {
                tracing::warn!(attempt, "Controller busy, resending last frame");
            }
            DnldEvent::Timeout { command } => {
                tracing::warn!(command = %command, "Response timeout");
            }
            DnldEvent::VenReset => {
                tracing::warn!("Performing VEN reset");
            }
            DnldEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DnldEvent::Finished { command, error } => match error {
                None => tracing::info!(command = %command, "Command complete"),
                Some(e) => tracing::error!(command = %command, "Command failed: {}", e),
            },
        }
    }
}

/// Observer that records every event, for tests and front-ends that replay them.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<DnldEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    pub fn events(&self) -> Vec<DnldEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl DnldObserver for RecordingObserver {
    fn on_event(&self, event: &DnldEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
