//! Soft time budget for cooperative phases.

use std::time::{Duration, Instant};

/// Records processed between clock polls inside table phases.
pub const DEFAULT_TIME_GRANULARITY: u32 = 100;

/// A soft deadline shared by every phase of one tick.
///
/// Once exceeded, the budget stays exceeded for the rest of the tick so
/// later phases bail out immediately.
#[derive(Debug, Clone)]
pub struct TimeBudget {
    start: Instant,
    limit: Option<Duration>,
    granularity: u32,
    calls: u32,
    exceeded: bool,
}

impl TimeBudget {
    /// Budget that never runs out.
    pub fn unlimited() -> Self {
        Self::with_limit(None)
    }

    /// Budget of `limit` starting now.
    pub fn new(limit: Duration) -> Self {
        Self::with_limit(Some(limit))
    }

    /// Budget ending at `deadline`.
    pub fn until(deadline: Instant) -> Self {
        Self::new(deadline.saturating_duration_since(Instant::now()))
    }

    pub fn with_limit(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
            granularity: DEFAULT_TIME_GRANULARITY,
            calls: 0,
            exceeded: false,
        }
    }

    /// Set how many records pass between clock polls.
    pub fn with_granularity(mut self, granularity: u32) -> Self {
        self.granularity = granularity.max(1);
        self
    }

    #[inline]
    pub fn is_limited(&self) -> bool {
        self.limit.is_some()
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Poll the clock now. Used at phase boundaries.
    pub fn is_exceeded(&mut self) -> bool {
        if self.exceeded {
            return true;
        }
        if let Some(limit) = self.limit {
            if self.start.elapsed() >= limit {
                self.exceeded = true;
            }
        }
        self.exceeded
    }

    /// Count one record and poll the clock every `granularity` records.
    pub fn record_exceeded(&mut self) -> bool {
        if self.exceeded {
            return true;
        }
        self.calls = self.calls.wrapping_add(1);
        if self.calls % self.granularity == 0 {
            return self.is_exceeded();
        }
        false
    }

    /// Whether a previous poll already tripped the budget.
    #[inline]
    pub fn was_exceeded(&self) -> bool {
        self.exceeded
    }
}

impl Default for TimeBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}
