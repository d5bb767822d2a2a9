//! Dispatch queue and workers.
//!
//! Accepting a request only records a `queued` deployment and submits a job
//! here. Workers pull jobs, bind them to a VM and drive the state machine to
//! completion. Jobs for the same environment never run at the same time.

mod queue;
mod worker;

use std::time::Duration;

pub use queue::{DispatchQueue, Job};
pub use worker::{DispatchStats, Dispatcher, StatsSnapshot};

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a policy starting at `base` and never exceeding `max`.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
