//! Single-threaded cooperative timer queue.
//!
//! Timers are one-shot: a repeating timer reschedules itself from its own
//! callback. Due timers pop in deadline order, ties broken by scheduling order,
//! so two timers due at the same instant fire in the order they were set.
//! A cancelled timer is never returned by `pop_due`.
//!
//! Nothing here reads the clock; callers pass `now` explicitly, which keeps
//! tests deterministic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Handle to one scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub struct Scheduler<E> {
    queue: BinaryHeap<Reverse<(Instant, TimerId)>>,
    pending: HashMap<TimerId, E>,
    next_id: u64,
    scheduled: u64,
    cancelled: u64,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
            scheduled: 0,
            cancelled: 0,
        }
    }

    pub fn schedule_at(&mut self, deadline: Instant, event: E) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.scheduled += 1;
        self.queue.push(Reverse((deadline, id)));
        self.pending.insert(id, event);
        id
    }

    pub fn schedule_after(&mut self, now: Instant, delay: Duration, event: E) -> TimerId {
        self.schedule_at(now + delay, event)
    }

    /// Cancel a pending timer. Returns its event, or `None` if it already
    /// fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> Option<E> {
        let event = self.pending.remove(&id)?;
        self.cancelled += 1;
        Some(event)
    }

    /// Next timer due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, E)> {
        while let Some(Reverse((deadline, id))) = self.queue.peek().copied() {
            if !self.pending.contains_key(&id) {
                // Cancelled; drop the stale heap entry.
                self.queue.pop();
                continue;
            }
            if deadline > now {
                return None;
            }
            self.queue.pop();
            return self.pending.remove(&id).map(|event| (id, event));
        }
        None
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.queue.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(deadline);
            }
            self.queue.pop();
        }
        None
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of live timers.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Timers ever scheduled.
    pub fn scheduled_count(&self) -> u64 {
        self.scheduled
    }

    /// Timers cancelled before firing.
    pub fn cancelled_count(&self) -> u64 {
        self.cancelled
    }

    /// Drop every pending timer without counting them as cancelled.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
    }
}
