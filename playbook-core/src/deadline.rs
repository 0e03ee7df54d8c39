//! Caller-supplied deadlines threaded through every trigger handler.

use std::time::{Duration, Instant};

/// An absolute point in time after which work must stop.
///
/// Handlers receive one per invocation and hand the remaining budget to
/// each LLM call; an exhausted deadline degrades to a no-op rather than
/// leaving partial state behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }

    /// A deadline at an explicit instant.
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    /// Remaining budget, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.checked_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Remaining budget capped at `limit`; `None` once expired.
    pub fn remaining_capped(&self, limit: Duration) -> Option<Duration> {
        self.remaining().map(|d| d.min(limit))
    }
}
