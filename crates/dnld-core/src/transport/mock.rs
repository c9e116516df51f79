//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{DeviceMode, Transport, TransportError};
use crate::dispatch::{ReadCompletion, WriteCompletion};
use crate::protocol::frame;

/// How the mock completes writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteBehavior {
    /// Accept and complete successfully.
    #[default]
    Succeed,
    /// Refuse the request synchronously.
    Reject,
    /// Accept, then complete with an error.
    FailAsync,
}

/// Mock transport for unit testing state machine logic.
///
/// Cloning shares all queues, so a test can hand one clone to the engine and
/// keep another for inspection.
#[derive(Clone, Default)]
pub struct MockTransport {
    /// Queued responses returned on read.
    rsp_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Captured mode switches.
    mode_log: Arc<Mutex<Vec<DeviceMode>>>,
    /// Read parked until a response is pushed.
    pending_read: Arc<Mutex<Option<ReadCompletion>>>,
    write_behavior: Arc<Mutex<WriteBehavior>>,
    aborts: Arc<Mutex<usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw response bytes to be returned on a later read.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.rsp_queue.lock().unwrap().push_back(bytes.to_vec());
        self.flush_pending();
    }

    /// Queue a well-formed response frame with `status` and `payload`.
    pub fn queue_status(&self, status: u8, payload: &[u8]) {
        match frame::encode(status, payload, false) {
            Ok(raw) => self.queue_response(&raw),
            Err(e) => panic!("mock response does not fit a frame: {}", e),
        }
    }

    /// Queue the same status `count` times.
    pub fn queue_status_n(&self, status: u8, count: usize) {
        for _ in 0..count {
            self.queue_status(status, &[]);
        }
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Get all captured mode switches.
    pub fn get_modes(&self) -> Vec<DeviceMode> {
        self.mode_log.lock().unwrap().clone()
    }

    /// Change how subsequent writes complete.
    pub fn set_write_behavior(&self, behavior: WriteBehavior) {
        *self.write_behavior.lock().unwrap() = behavior;
    }

    /// Whether a read is parked waiting for data.
    pub fn has_pending_read(&self) -> bool {
        self.pending_read.lock().unwrap().is_some()
    }

    /// Number of times the engine aborted a read.
    pub fn abort_count(&self) -> usize {
        *self.aborts.lock().unwrap()
    }

    /// Number of responses still queued.
    pub fn queued_responses(&self) -> usize {
        self.rsp_queue.lock().unwrap().len()
    }

    fn flush_pending(&self) {
        let mut pending = self.pending_read.lock().unwrap();
        if pending.is_none() {
            return;
        }
        let next = self.rsp_queue.lock().unwrap().pop_front();
        if let (Some(bytes), Some(done)) = (next, pending.take()) {
            done.complete(Ok(bytes));
        }
    }
}

impl Transport for MockTransport {
    fn write(&self, frame: &[u8], done: WriteCompletion) -> Result<(), TransportError> {
        let behavior = *self.write_behavior.lock().unwrap();
        if behavior == WriteBehavior::Reject {
            return Err(TransportError::WriteFailed("rejected by mock".into()));
        }
        self.write_log.lock().unwrap().push(frame.to_vec());
        match behavior {
            WriteBehavior::FailAsync => {
                done.complete(Err(TransportError::WriteFailed("mock write error".into())))
            }
            _ => done.complete(Ok(())),
        }
        Ok(())
    }

    fn read(&self, _max_len: usize, done: ReadCompletion) -> Result<(), TransportError> {
        let mut pending = self.pending_read.lock().unwrap();
        if pending.is_some() {
            return Err(TransportError::ReadPending);
        }
        match self.rsp_queue.lock().unwrap().pop_front() {
            Some(bytes) => done.complete(Ok(bytes)),
            None => *pending = Some(done),
        }
        Ok(())
    }

    fn abort_read(&self) {
        *self.aborts.lock().unwrap() += 1;
        self.pending_read.lock().unwrap().take();
    }

    fn set_mode(&self, mode: DeviceMode) -> Result<(), TransportError> {
        self.mode_log.lock().unwrap().push(mode);
        Ok(())
    }
}
