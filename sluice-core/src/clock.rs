//! User clocks: callbacks run on a pool thread at a given time
//!
//! A clock belongs to one event manager and fires from that manager's timer
//! queue, so a clock registered next to a channel runs on the same thread as
//! the channel's callbacks. Periodic clocks are rescheduled from their
//! previous deadline, not from the end of the callback, so a slow callback
//! does not make the schedule drift.

use crate::handler::ClockCallback;
use crate::timer::deadline_after;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool-unique clock identifier, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockId(pub u64);

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered clock as held by its owning manager
pub(crate) struct Clock {
    id: ClockId,
    due: Instant,
    period: Option<Duration>,
    callback: ClockCallback,
    /// Set by `deregister_clock` on the caller's thread
    cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("id", &self.id)
            .field("due", &self.due)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl Clock {
    pub(crate) fn new(
        id: ClockId,
        due: Instant,
        period: Option<Duration>,
        callback: ClockCallback,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self { id, due, period, callback, cancelled }
    }

    pub(crate) fn id(&self) -> ClockId {
        self.id
    }

    pub(crate) fn due(&self) -> Instant {
        self.due
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn callback(&mut self) -> &mut ClockCallback {
        &mut self.callback
    }

    /// Move a periodic clock to its next deadline; `None` for one-shot clocks
    pub(crate) fn advance(&mut self) -> Option<Instant> {
        let period = self.period?;
        self.due = deadline_after(self.due, period);
        Some(self.due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(period: Option<Duration>) -> (Clock, Arc<AtomicBool>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let clock = Clock::new(ClockId(1), Instant::now(), period, Box::new(|_, _| {}), cancelled.clone());
        (clock, cancelled)
    }

    #[test]
    fn test_periodic_clock_advances_from_previous_deadline() {
        let (mut clock, _) = clock(Some(Duration::from_millis(10)));
        let first = clock.due();
        assert_eq!(clock.advance(), Some(first + Duration::from_millis(10)));
        assert_eq!(clock.advance(), Some(first + Duration::from_millis(20)));
    }

    #[test]
    fn test_one_shot_clock_does_not_advance() {
        let (mut clock, cancelled) = clock(None);
        assert_eq!(clock.advance(), None);

        assert!(!clock.is_cancelled());
        cancelled.store(true, Ordering::Release);
        assert!(clock.is_cancelled());
    }

    #[test]
    fn test_display() {
        assert_eq!(ClockId(12).to_string(), "12");
    }
}
