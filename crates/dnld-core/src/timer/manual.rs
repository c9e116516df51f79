//! Manually driven timer service for deterministic tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TimerError, TimerId, TimerService};
use crate::dispatch::TimerExpiry;

struct Armed {
    timeout: Duration,
    expiry: TimerExpiry,
}

#[derive(Default)]
struct ManualState {
    next_id: u32,
    timers: BTreeMap<u32, Option<Armed>>,
    /// Timeout of every `start` call, in order.
    history: Vec<Duration>,
    fail_create: bool,
    fail_start: bool,
}

/// Timer service whose timers only fire when the test says so.
#[derive(Clone, Default)]
pub struct ManualTimerService {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Make subsequent `start` calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    /// Fire the lowest-numbered armed timer. Returns its timeout.
    pub fn fire_next(&self) -> Option<Duration> {
        let armed = {
            let mut st = self.state.lock().unwrap();
            st.timers.values_mut().find_map(Option::take)
        };
        armed.map(|a| {
            a.expiry.fire();
            a.timeout
        })
    }

    /// Fire `id` if it is armed.
    pub fn fire(&self, id: TimerId) -> bool {
        let armed = {
            let mut st = self.state.lock().unwrap();
            st.timers.get_mut(&id.0).and_then(Option::take)
        };
        match armed {
            Some(a) => {
                a.expiry.fire();
                true
            }
            None => false,
        }
    }

    /// Currently armed timers with their timeouts.
    pub fn armed(&self) -> Vec<(TimerId, Duration)> {
        let st = self.state.lock().unwrap();
        st.timers
            .iter()
            .filter_map(|(&id, slot)| slot.as_ref().map(|a| (TimerId(id), a.timeout)))
            .collect()
    }

    /// Timers created and not yet deleted.
    pub fn live_timers(&self) -> usize {
        self.state.lock().unwrap().timers.len()
    }

    /// Timeouts passed to `start`, oldest first.
    pub fn start_history(&self) -> Vec<Duration> {
        self.state.lock().unwrap().history.clone()
    }
}

impl TimerService for ManualTimerService {
    fn create(&self) -> Result<TimerId, TimerError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_create {
            return Err(TimerError::Exhausted);
        }
        st.next_id += 1;
        let id = st.next_id;
        st.timers.insert(id, None);
        Ok(TimerId(id))
    }

    fn start(
        &self,
        id: TimerId,
        timeout: Duration,
        expiry: TimerExpiry,
    ) -> Result<(), TimerError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_start {
            return Err(TimerError::Exhausted);
        }
        st.history.push(timeout);
        match st.timers.get_mut(&id.0) {
            Some(slot) => {
                *slot = Some(Armed { timeout, expiry });
                Ok(())
            }
            None => Err(TimerError::UnknownTimer(id)),
        }
    }

    fn stop(&self, id: TimerId) -> Result<(), TimerError> {
        let mut st = self.state.lock().unwrap();
        match st.timers.get_mut(&id.0) {
            Some(slot) => {
                slot.take();
                Ok(())
            }
            None => Err(TimerError::UnknownTimer(id)),
        }
    }

    fn delete(&self, id: TimerId) -> Result<(), TimerError> {
        let mut st = self.state.lock().unwrap();
        st.timers
            .remove(&id.0)
            .map(|_| ())
            .ok_or(TimerError::UnknownTimer(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;
    use crate::dispatch::EngineEvent;

    #[test]
    fn test_fire_next() {
        let (tx, rx) = channel();
        let svc = ManualTimerService::new();
        let id = svc.create().unwrap();
        assert_eq!(svc.fire_next(), None);

        svc.start(id, Duration::from_millis(50), TimerExpiry::new(4, tx))
            .unwrap();
        assert_eq!(svc.armed(), vec![(id, Duration::from_millis(50))]);
        assert_eq!(svc.fire_next(), Some(Duration::from_millis(50)));
        assert!(svc.armed().is_empty());
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::TimerExpired { ticket: 4 }));
    }

    #[test]
    fn test_stop_and_delete() {
        let (tx, _rx) = channel();
        let svc = ManualTimerService::new();
        let id = svc.create().unwrap();
        svc.start(id, Duration::from_secs(1), TimerExpiry::new(1, tx))
            .unwrap();
        svc.stop(id).unwrap();
        assert!(!svc.fire(id));
        assert_eq!(svc.live_timers(), 1);

        svc.delete(id).unwrap();
        assert_eq!(svc.live_timers(), 0);
        assert!(svc.delete(id).is_err());
    }

    #[test]
    fn test_injected_failures() {
        let (tx, _rx) = channel();
        let svc = ManualTimerService::new();
        svc.set_fail_create(true);
        assert!(svc.create().is_err());
        svc.set_fail_create(false);

        let id = svc.create().unwrap();
        svc.set_fail_start(true);
        assert!(svc.start(id, Duration::from_secs(1), TimerExpiry::new(1, tx)).is_err());
        assert!(svc.start_history().is_empty());
    }
}
