//! Pending-timer bookkeeping for the reactor.
//!
//! Timers live in an ordered set keyed by `(expiration, id)` so that
//! entries expiring in the same cycle fire in insertion order. A separate
//! id index allows O(log n) cancellation. The set never holds an entry
//! that is mid-callback; those are tracked in `in_flight` so a cancel
//! issued from inside the callback can still suppress a repeat
//! reinsertion.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Handle returned by `run_after`/`run_every`, usable with `cancel_timer`.
pub type TimerId = u64;

pub(crate) struct TimerEntry {
    pub interval_ns: u64,
    pub repeat: bool,
    pub callback: Box<dyn FnMut()>,
}

/// One expired timer, popped out of the set for execution.
pub(crate) struct Expired {
    pub id: TimerId,
    pub expiration_ns: u64,
    pub entry: TimerEntry,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    queue: BTreeMap<(u64, TimerId), TimerEntry>,
    index: HashMap<TimerId, u64>,
    in_flight: HashSet<TimerId>,
    cancelled_in_flight: HashSet<TimerId>,
    next_id: TimerId,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Earliest pending expiration, if any.
    pub fn earliest_ns(&self) -> Option<u64> {
        self.queue.keys().next().map(|&(ns, _)| ns)
    }

    /// Inserts a new timer. Returns its id and whether the head of the
    /// set changed (the caller must then re-arm the timerfd).
    pub fn insert(&mut self, expiration_ns: u64, entry: TimerEntry) -> (TimerId, bool) {
        let id = self.next_id;
        self.next_id += 1;
        let head_changed = self.insert_with_id(id, expiration_ns, entry);
        (id, head_changed)
    }

    /// Reinserts a repeating timer under its original id so that the
    /// handle returned at scheduling time stays valid across firings.
    pub fn insert_with_id(&mut self, id: TimerId, expiration_ns: u64, entry: TimerEntry) -> bool {
        let head_changed = match self.earliest_ns() {
            None => true,
            Some(head) => expiration_ns < head,
        };
        self.queue.insert((expiration_ns, id), entry);
        self.index.insert(id, expiration_ns);
        head_changed
    }

    /// Removes a timer. `Ok(true)` means the head of the set changed.
    /// A timer currently executing its callback is marked so it will not
    /// be reinserted; the in-flight call itself is unaffected.
    pub fn cancel(&mut self, id: TimerId) -> Result<bool, ()> {
        if let Some(expiration_ns) = self.index.remove(&id) {
            let was_head = self.earliest_ns() == Some(expiration_ns);
            self.queue.remove(&(expiration_ns, id));
            return Ok(was_head);
        }
        if self.in_flight.contains(&id) {
            self.cancelled_in_flight.insert(id);
            return Ok(false);
        }
        Err(())
    }

    /// Moves every entry with `expiration <= now` out of the set, in
    /// `(expiration, id)` order, marking them in-flight.
    pub fn pop_expired(&mut self, now_ns: u64) -> Vec<Expired> {
        let mut expired = Vec::new();
        while let Some((&(expiration_ns, id), _)) = self.queue.iter().next() {
            if expiration_ns > now_ns {
                break;
            }
            let entry = self.queue.remove(&(expiration_ns, id)).unwrap();
            self.index.remove(&id);
            self.in_flight.insert(id);
            expired.push(Expired {
                id,
                expiration_ns,
                entry,
            });
        }
        expired
    }

    /// Whether a cancel arrived while the given timer was in flight.
    pub fn take_cancelled(&mut self, id: TimerId) -> bool {
        self.cancelled_in_flight.remove(&id)
    }

    /// Clears in-flight tracking once a firing cycle is fully processed.
    pub fn finish_firing(&mut self) {
        self.in_flight.clear();
        self.cancelled_in_flight.clear();
    }
}
