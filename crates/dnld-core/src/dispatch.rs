//! Completion handles and the engine event queue.
//!
//! Transport and timer callbacks may run on threads the engine does not own.
//! They never touch the download context: each one-shot handle posts an
//! [`EngineEvent`] into the engine's queue, and the owner drains the queue
//! from a single thread.

use std::sync::mpsc::Sender;

use crate::transport::TransportError;

/// Event posted by a completion handle.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    WriteDone {
        ticket: u64,
        result: Result<(), TransportError>,
    },
    ReadDone {
        ticket: u64,
        result: Result<Vec<u8>, TransportError>,
    },
    TimerExpired {
        ticket: u64,
    },
}

impl EngineEvent {
    pub(crate) fn ticket(&self) -> u64 {
        match self {
            EngineEvent::WriteDone { ticket, .. }
            | EngineEvent::ReadDone { ticket, .. }
            | EngineEvent::TimerExpired { ticket } => *ticket,
        }
    }
}

fn post(tx: &Sender<EngineEvent>, event: EngineEvent) {
    let ticket = event.ticket();
    if tx.send(event).is_err() {
        tracing::trace!(ticket, "Engine gone, completion dropped");
    }
}

/// One-shot handle completing an asynchronous transport write.
#[derive(Debug)]
pub struct WriteCompletion {
    ticket: u64,
    tx: Sender<EngineEvent>,
}

impl WriteCompletion {
    pub(crate) fn new(ticket: u64, tx: Sender<EngineEvent>) -> Self {
        Self { ticket, tx }
    }

    /// Ticket identifying the write request.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Report the outcome of the write.
    pub fn complete(self, result: Result<(), TransportError>) {
        post(
            &self.tx,
            EngineEvent::WriteDone {
                ticket: self.ticket,
                result,
            },
        );
    }
}

/// One-shot handle completing an asynchronous transport read.
#[derive(Debug)]
pub struct ReadCompletion {
    ticket: u64,
    tx: Sender<EngineEvent>,
}

impl ReadCompletion {
    pub(crate) fn new(ticket: u64, tx: Sender<EngineEvent>) -> Self {
        Self { ticket, tx }
    }

    /// Ticket identifying the read request.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Deliver the received bytes (or a transport error).
    pub fn complete(self, result: Result<Vec<u8>, TransportError>) {
        post(
            &self.tx,
            EngineEvent::ReadDone {
                ticket: self.ticket,
                result,
            },
        );
    }
}

/// One-shot handle fired when an armed timer expires.
#[derive(Debug)]
pub struct TimerExpiry {
    ticket: u64,
    tx: Sender<EngineEvent>,
}

impl TimerExpiry {
    pub(crate) fn new(ticket: u64, tx: Sender<EngineEvent>) -> Self {
        Self { ticket, tx }
    }

    /// Ticket identifying this arming of the timer.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Signal expiry to the engine.
    pub fn fire(self) {
        post(&self.tx, EngineEvent::TimerExpired { ticket: self.ticket });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    #[test]
    fn test_handles_post_events() {
        let (tx, rx) = channel();
        WriteCompletion::new(1, tx.clone()).complete(Ok(()));
        ReadCompletion::new(2, tx.clone()).complete(Ok(vec![0xAB]));
        TimerExpiry::new(3, tx).fire();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], EngineEvent::WriteDone { ticket: 1, result: Ok(()) }));
        assert!(matches!(&events[1], EngineEvent::ReadDone { ticket: 2, result: Ok(b) } if b == &[0xAB]));
        assert!(matches!(events[2], EngineEvent::TimerExpired { ticket: 3 }));
    }

    #[test]
    fn test_completion_after_engine_dropped() {
        let (tx, rx) = channel();
        drop(rx);
        // Must not panic
        TimerExpiry::new(9, tx).fire();
    }
}
