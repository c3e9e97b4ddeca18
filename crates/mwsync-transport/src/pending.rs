//! Book-keeping for publishes awaiting broker acknowledgement.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Default)]
struct PendingState {
    /// QoS > 0 publishes handed to the client but not yet on the wire
    queued: usize,
    /// Packet ids on the wire, awaiting PUBACK / PUBCOMP
    in_flight: HashSet<u16>,
}

impl PendingState {
    fn len(&self) -> usize {
        self.queued + self.in_flight.len()
    }
}

/// Result of waiting for outstanding acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainOutcome {
    Drained,
    TimedOut { discarded: usize },
}

/// Shared between the caller and the network worker.
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    state: Mutex<PendingState>,
    changed: Condvar,
}

impl PendingAcks {
    pub(crate) fn queue(&self) {
        self.state.lock().queued += 1;
    }

    /// Undo `queue` for a publish the client refused.
    pub(crate) fn unqueue(&self) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(1);
    }

    /// A queued publish was written with packet id `pkid`.
    pub(crate) fn sent(&self, pkid: u16) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(1);
        state.in_flight.insert(pkid);
    }

    pub(crate) fn acknowledge(&self, pkid: u16) {
        let mut state = self.state.lock();
        if state.in_flight.remove(&pkid) {
            self.changed.notify_all();
        }
    }

    /// Forget everything outstanding, returning how many were dropped.
    pub(crate) fn discard(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.len();
        state.queued = 0;
        state.in_flight.clear();
        self.changed.notify_all();
        dropped
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Block until nothing is outstanding.
    ///
    /// Each wait lasts at most `cycle`; progress restarts the wait, a cycle
    /// without any acknowledgement discards the remainder.
    pub(crate) fn wait_drained(&self, cycle: Duration) -> DrainOutcome {
        let mut state = self.state.lock();
        while state.len() > 0 {
            let before = state.len();
            tracing::debug!(pending = before, "Waiting for publish acknowledgements");
            let timed_out = self.changed.wait_for(&mut state, cycle).timed_out();
            if timed_out && state.len() >= before {
                let discarded = state.len();
                state.queued = 0;
                state.in_flight.clear();
                return DrainOutcome::TimedOut { discarded };
            }
        }
        DrainOutcome::Drained
    }
}
