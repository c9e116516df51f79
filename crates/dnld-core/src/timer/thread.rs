//! Thread-backed timer service.
//!
//! Each arming spawns a short-lived sleeper thread that waits on a condition
//! variable, so `stop` wakes it immediately instead of leaving it to sleep out
//! the full timeout.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::trace;

use super::traits::{TimerError, TimerId, TimerService};
use crate::dispatch::TimerExpiry;

#[derive(Default)]
struct Arming {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Arming {
    fn cancel(&self) {
        if let Ok(mut c) = self.cancelled.lock() {
            *c = true;
        }
        self.wake.notify_all();
    }
}

#[derive(Default)]
struct Timers {
    next_id: u32,
    /// Created timers and their current arming, if any.
    armed: HashMap<u32, Option<Arc<Arming>>>,
}

/// Timer service backed by `std::thread`.
#[derive(Clone, Default)]
pub struct ThreadTimerService {
    timers: Arc<Mutex<Timers>>,
}

impl ThreadTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_timers<R>(&self, f: impl FnOnce(&mut Timers) -> R) -> Result<R, TimerError> {
        let mut timers = self.timers.lock().map_err(|_| TimerError::Poisoned)?;
        Ok(f(&mut timers))
    }
}

impl TimerService for ThreadTimerService {
    fn create(&self) -> Result<TimerId, TimerError> {
        self.with_timers(|t| {
            t.next_id = t.next_id.checked_add(1).ok_or(TimerError::Exhausted)?;
            t.armed.insert(t.next_id, None);
            Ok(TimerId(t.next_id))
        })?
    }

    fn start(
        &self,
        id: TimerId,
        timeout: Duration,
        expiry: TimerExpiry,
    ) -> Result<(), TimerError> {
        let arming = Arc::new(Arming::default());
        self.with_timers(|t| match t.armed.get_mut(&id.0) {
            Some(slot) => {
                if let Some(previous) = slot.replace(arming.clone()) {
                    previous.cancel();
                }
                Ok(())
            }
            None => Err(TimerError::UnknownTimer(id)),
        })??;

        trace!(%id, timeout_ms = timeout.as_millis() as u64, "Timer armed");
        thread::Builder::new()
            .name(format!("dnld-{}", id))
            .spawn(move || {
                let Ok(guard) = arming.cancelled.lock() else {
                    return;
                };
                let Ok((guard, _)) = arming.wake.wait_timeout_while(guard, timeout, |c| !*c)
                else {
                    return;
                };
                if !*guard {
                    drop(guard);
                    expiry.fire();
                }
            })?;
        Ok(())
    }

    fn stop(&self, id: TimerId) -> Result<(), TimerError> {
        self.with_timers(|t| match t.armed.get_mut(&id.0) {
            Some(slot) => {
                if let Some(arming) = slot.take() {
                    arming.cancel();
                }
                Ok(())
            }
            None => Err(TimerError::UnknownTimer(id)),
        })?
    }

    fn delete(&self, id: TimerId) -> Result<(), TimerError> {
        self.with_timers(|t| match t.armed.remove(&id.0) {
            Some(slot) => {
                if let Some(arming) = slot {
                    arming.cancel();
                }
                Ok(())
            }
            None => Err(TimerError::UnknownTimer(id)),
        })?
    }
}
