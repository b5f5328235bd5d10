//! Virtual-time event queue.
//!
//! Events are delivered in non-decreasing time order. Events scheduled for the
//! same instant come out in the order they were scheduled, so anything that must
//! observe the effects of another same-instant event has to be scheduled later.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use thiserror::Error;

use crate::zm_interface::SimTime;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("cannot schedule at {at}us, clock is already at {now}us")]
    InPast { at: SimTime, now: SimTime },
}

/// Ordering key of a scheduled event: time first, then insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    pub time: SimTime,
    pub sequence: u64,
}

struct Entry<E> {
    key: EventKey,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<E> Eq for Entry<E> {}

impl<E> Ord for Entry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so the max-heap pops the earliest key
        other.key.cmp(&self.key)
    }
}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Single-threaded discrete-event scheduler driven by a virtual clock.
pub struct Scheduler<E> {
    now: SimTime,
    next_sequence: u64,
    queue: BinaryHeap<Entry<E>>,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            now: 0,
            next_sequence: 0,
            queue: BinaryHeap::new(),
        }
    }

    /// Current virtual time (time of the last popped event).
    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Schedule `event` at absolute time `at`.
    pub fn schedule_at(&mut self, at: SimTime, event: E) -> Result<EventKey, ScheduleError> {
        if at < self.now {
            return Err(ScheduleError::InPast { at, now: self.now });
        }
        let key = EventKey {
            time: at,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.queue.push(Entry { key, event });
        Ok(key)
    }

    /// Schedule `event` `delay` after the current time.
    pub fn schedule_in(&mut self, delay: SimTime, event: E) -> EventKey {
        let key = EventKey {
            time: self.now.saturating_add(delay),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.queue.push(Entry { key, event });
        key
    }

    /// Time of the next pending event, if any.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.queue.peek().map(|e| e.key.time)
    }

    /// Remove the earliest event and advance the clock to its time.
    pub fn pop(&mut self) -> Option<(SimTime, E)> {
        let entry = self.queue.pop()?;
        self.now = entry.key.time;
        Some((entry.key.time, entry.event))
    }
}
