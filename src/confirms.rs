use crate::errors::*;
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

/// Publisher-confirm bookkeeping for one channel.
///
/// Once confirms are enabled, every publish claims the next sequence number
/// and parks it in the unconfirmed set *before* the frames reach the wire, so
/// an ack racing in from the server can never refer to a sequence number the
/// tracker has not seen. Acks and nacks drain the set; `wait_for_confirms`
/// blocks until it is empty.
pub(crate) struct ConfirmTracker {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    // 0 until confirm.select; first publish after that is sequence number 1
    next_publish_seq_no: u64,
    unconfirmed: BTreeSet<u64>,
    // latched by any nack, cleared on each wait_for_confirms return
    nacked: bool,
    // terminal failure; every current and future waiter observes it
    failure: Option<Error>,
}

impl ConfirmTracker {
    pub(crate) fn new() -> ConfirmTracker {
        ConfirmTracker {
            state: Mutex::new(State {
                next_publish_seq_no: 0,
                unconfirmed: BTreeSet::new(),
                nacked: false,
                failure: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Put the tracker in confirm mode. Idempotent; only the first call
    /// initializes the sequence counter.
    pub(crate) fn enable(&self) {
        let mut state = self.state.lock().unwrap();
        if state.next_publish_seq_no == 0 {
            state.next_publish_seq_no = 1;
            state.unconfirmed.clear();
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().next_publish_seq_no > 0
    }

    pub(crate) fn next_publish_seq_no(&self) -> u64 {
        self.state.lock().unwrap().next_publish_seq_no
    }

    /// Claim the sequence number for a publish that is about to be written.
    /// Returns `None` when confirms are not enabled.
    pub(crate) fn register_publish(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        if state.next_publish_seq_no == 0 {
            return None;
        }
        let seq_no = state.next_publish_seq_no;
        state.next_publish_seq_no += 1;
        state.unconfirmed.insert(seq_no);
        Some(seq_no)
    }

    /// Apply a `basic.ack` or `basic.nack` from the server.
    pub(crate) fn handle_ack_or_nack(&self, delivery_tag: u64, multiple: bool, is_nack: bool) {
        let mut state = self.state.lock().unwrap();
        if multiple {
            // everything at or below the tag is covered
            let keep = state.unconfirmed.split_off(&(delivery_tag + 1));
            state.unconfirmed = keep;
        } else {
            state.unconfirmed.remove(&delivery_tag);
        }
        if is_nack {
            state.nacked = true;
        }
        if state.unconfirmed.is_empty() {
            self.cond.notify_all();
        }
    }

    /// Block until every outstanding publish is confirmed. Returns false if
    /// any nack was observed since the previous call; the nack latch resets on
    /// each return.
    pub(crate) fn wait_for_confirms(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(failure) = &state.failure {
                return Err(failure.fanout());
            }
            if state.unconfirmed.is_empty() {
                let all_acked = !state.nacked;
                state.nacked = false;
                return Ok(all_acked);
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    pub(crate) fn unconfirmed_count(&self) -> usize {
        self.state.lock().unwrap().unconfirmed.len()
    }

    /// Fail every current and future waiter.
    pub(crate) fn abort(&self, err: &Error) {
        let mut state = self.state.lock().unwrap();
        state.failure = Some(err.fanout());
        self.cond.notify_all();
    }

    /// Reset after a successful connection recovery. Publishes that were in
    /// flight when the transport died are in doubt; they are dropped from the
    /// set and reported through the nack latch. Sequence numbering restarts
    /// the way the new transport's broker sees it.
    pub(crate) fn reset_for_recovery(&self) {
        let mut state = self.state.lock().unwrap();
        if state.next_publish_seq_no == 0 {
            return;
        }
        if !state.unconfirmed.is_empty() {
            state.unconfirmed.clear();
            state.nacked = true;
        }
        state.next_publish_seq_no = 1;
        state.failure = None;
        self.cond.notify_all();
    }
}
