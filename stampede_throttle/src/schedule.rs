//! The scheduling cursor
//!
//! The non-async interior of [`crate::Throttle`]. A `Cursor` holds the next
//! scheduled instant, in clock ticks, and advances it from the *scheduled*
//! instant rather than from the instant the caller actually got around to
//! emitting. A caller that falls behind is told to go immediately until it has
//! caught up; lateness never shifts the rest of the schedule.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Position of a single worker in its arrival schedule.
pub struct Cursor {
    next: u64,
}

impl Cursor {
    /// Create a new `Cursor` whose first instant is `start`.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self { next: start }
    }

    /// The next scheduled instant.
    #[must_use]
    pub fn due(&self) -> u64 {
        self.next
    }

    /// Ticks a caller must wait at `now` before the next instant, zero when the
    /// instant has arrived or passed.
    #[must_use]
    pub fn slop(&self, now: u64) -> u64 {
        self.next.saturating_sub(now)
    }

    /// How far `now` is past the next instant, zero when on time.
    #[must_use]
    pub fn lag(&self, now: u64) -> u64 {
        now.saturating_sub(self.next)
    }

    /// Move the next instant `gap` ticks past the current one.
    pub fn advance(&mut self, gap: u64) {
        self.next = self.next.saturating_add(gap);
    }

    /// Schedule the next instant at exactly `at`.
    pub fn set(&mut self, at: u64) {
        self.next = at;
    }

    /// Restart the schedule at `now`, discarding any debt accumulated while
    /// the caller was not waiting. Returns the number of ticks discarded.
    pub fn rebase(&mut self, now: u64) -> u64 {
        let skipped = self.lag(now);
        self.next = now;
        skipped
    }
}
