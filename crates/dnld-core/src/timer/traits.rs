//! Timer service abstraction.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::TimerExpiry;

/// Handle of a timer created by a [`TimerService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u32);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum TimerError {
    #[error("No timer resources available")]
    Exhausted,

    #[error("Unknown timer {0}")]
    UnknownTimer(TimerId),

    #[error("Timer service state poisoned")]
    Poisoned,

    #[error("Failed to start timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// OS timer service.
///
/// A timer is created once per command session, armed any number of times,
/// and deleted when the session ends. Expiry is signalled on a thread the
/// engine does not own through the one-shot [`TimerExpiry`] handle.
pub trait TimerService: Send + Sync {
    fn create(&self) -> Result<TimerId, TimerError>;

    /// Arm `id` to fire after `timeout`. Re-arming replaces the previous expiry.
    fn start(&self, id: TimerId, timeout: Duration, expiry: TimerExpiry)
    -> Result<(), TimerError>;

    /// Disarm `id`. Stopping an idle timer is not an error.
    fn stop(&self, id: TimerId) -> Result<(), TimerError>;

    fn delete(&self, id: TimerId) -> Result<(), TimerError>;
}

impl<S: TimerService + ?Sized> TimerService for std::sync::Arc<S> {
    fn create(&self) -> Result<TimerId, TimerError> {
        (**self).create()
    }

    fn start(
        &self,
        id: TimerId,
        timeout: Duration,
        expiry: TimerExpiry,
    ) -> Result<(), TimerError> {
        (**self).start(id, timeout, expiry)
    }

    fn stop(&self, id: TimerId) -> Result<(), TimerError> {
        (**self).stop(id)
    }

    fn delete(&self, id: TimerId) -> Result<(), TimerError> {
        (**self).delete(id)
    }
}
