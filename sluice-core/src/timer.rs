//! TimerQueue - min-heap of deadlines
//!
//! Event loops keep their pending deadlines (retry waits, connect timeouts,
//! shutdown grace) in a `TimerQueue` and bound every multiplexer wait by
//! [`TimerQueue::timeout`]. Entries are never removed early; owners tag the
//! payload with whatever they need to recognise a stale timer when it fires.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Longest delay a timer honours
pub const MAX_DELAY: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `now + delay`, clamped to a representable instant
pub fn deadline_after(now: Instant, delay: Duration) -> Instant {
    let mut delay = delay.min(MAX_DELAY);
    loop {
        if let Some(deadline) = now.checked_add(delay) {
            return deadline;
        }
        delay /= 2;
    }
}

#[derive(Debug)]
struct TimerEntry<T> {
    deadline: Instant,
    /// Insertion order, keeps equal deadlines FIFO
    seq: u64,
    payload: T,
}

impl<T> PartialEq for TimerEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for TimerEntry<T> {}

impl<T> Ord for TimerEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (BinaryHeap is max-heap by default)
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for TimerEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadlines ordered earliest first
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<TimerEntry<T>>,
    next_seq: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), next_seq: 0 }
    }

    /// Schedule `payload` to fire at `deadline`
    pub fn schedule(&mut self, deadline: Instant, payload: T) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(TimerEntry { deadline, seq, payload });
    }

    /// Schedule `payload` to fire `delay` from now
    ///
    /// Delays past [`MAX_DELAY`] are clamped, so `Duration::MAX` means
    /// "effectively never" instead of an overflowing deadline.
    pub fn schedule_after(&mut self, delay: Duration, payload: T) {
        self.schedule(deadline_after(Instant::now(), delay), payload);
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Wait bound for a loop: time until the next deadline, capped at `max`
    pub fn timeout(&self, now: Instant, max: Duration) -> Duration {
        match self.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).min(max),
            None => max,
        }
    }

    /// Pop the next payload whose deadline is <= `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        if self.heap.peek()?.deadline <= now {
            self.heap.pop().map(|e| e.payload)
        } else {
            None
        }
    }

    /// Pop every payload whose deadline is <= `now`, earliest first
    pub fn drain_expired(&mut self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        while let Some(payload) = self.pop_expired(now) {
            fired.push(payload);
        }
        fired
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
