//! Cancellable timer queue
//!
//! Deadlines live in a binary min-heap; the authoritative set of pending
//! timers lives in a map. Cancelling removes the map entry and the heap entry
//! is skipped when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Timer queue carrying events of type `E`
#[derive(Debug)]
pub struct TimerQueue<E> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, (Instant, E)>,
    next_id: u64,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` at an absolute deadline
    pub fn schedule_at(&mut self, at: Instant, event: E) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((at, id)));
        self.pending.insert(id, (at, event));
        TimerId(id)
    }

    /// Schedule `event` after `delay`
    pub fn schedule(&mut self, now: Instant, delay: Duration, event: E) -> TimerId {
        self.schedule_at(now + delay, event)
    }

    /// Cancel a timer; returns its event if it had not fired yet
    pub fn cancel(&mut self, id: TimerId) -> Option<E> {
        self.pending.remove(&id.0).map(|(_, event)| event)
    }

    /// Whether the timer is still waiting to fire
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.contains_key(&id.0)
    }

    /// Deadline of a pending timer
    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.pending.get(&id.0).map(|(at, _)| *at)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop the next timer due at or before `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, E)> {
        self.discard_stale();
        let Reverse((at, id)) = *self.heap.peek()?;
        if at > now {
            return None;
        }
        self.heap.pop();
        self.pending.remove(&id).map(|(_, event)| (TimerId(id), event))
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending timer
    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((at, id))) = self.heap.peek() {
            match self.pending.get(id) {
                Some((deadline, _)) if deadline == at => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}
