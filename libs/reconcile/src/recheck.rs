//! Periodic re-verification after a successful pass.
//!
//! Remote APIs may serve stale reads or silently drop writes, so a pass that
//! succeeded is re-run later anyway. The interval grows while nothing
//! changes and snaps back to the initial value whenever the pass had to
//! mutate remote state.

use std::time::Duration;

use tokio::time::Instant;

use crate::backoff::{BackoffPolicy, ExponentialBackoff};

/// Resettable schedule of recheck deadlines.
#[derive(Debug, Clone)]
pub struct RecheckSchedule {
    backoff: ExponentialBackoff,
    deadline: Option<Instant>,
}

impl Default for RecheckSchedule {
    fn default() -> Self {
        Self::new(BackoffPolicy::recheck())
    }
}

impl RecheckSchedule {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            backoff: ExponentialBackoff::new(policy),
            deadline: None,
        }
    }

    /// Schedule the next recheck, replacing any pending one.
    pub fn reschedule(&mut self) -> Duration {
        let now = Instant::now();
        let delay = self.backoff.next_delay_at(now);
        self.deadline = Some(now + delay);
        delay
    }

    /// Return the interval to its initial value. Does not touch the pending
    /// deadline.
    pub fn reset_interval(&mut self) {
        self.backoff.reset();
    }

    /// Drop the pending deadline.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
