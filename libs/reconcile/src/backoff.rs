//! Resettable exponential backoff.

use std::future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first retry, and after a reset.
    pub initial: Duration,

    /// Maximum delay (before jitter).
    pub max: Duration,

    /// Multiplier applied after each delay.
    pub factor: f64,

    /// Jitter factor (0.0 to 1.0), applied symmetrically.
    pub jitter: f64,

    /// If no backoff was taken for this long, the next delay starts again
    /// from `initial`.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.1,
            reset_after: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    /// Schedule used to re-verify remote state after a successful pass.
    pub fn recheck() -> Self {
        Self {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30 * 60),
            factor: 2.0,
            jitter: 0.1,
            reset_after: Duration::MAX,
        }
    }

    /// Apply this policy's jitter to `base`.
    pub fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let jitter = self.jitter.min(1.0);
        let scale = 1.0 + rand::rng().random_range(-jitter..=jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * scale).unwrap_or(base)
    }

    fn grow(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Stateful backoff sequence driven by a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
    last_backoff_start: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.initial;
        Self {
            policy,
            current,
            last_backoff_start: None,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Returns the next jittered delay.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_at(Instant::now())
    }

    /// Returns the next jittered delay as observed at `now`.
    pub fn next_delay_at(&mut self, now: Instant) -> Duration {
        let reset = match self.last_backoff_start {
            Some(last) => now.saturating_duration_since(last) > self.policy.reset_after,
            None => true,
        };
        if reset {
            self.current = self.policy.initial;
        }
        self.last_backoff_start = Some(now);

        let base = self.current.min(self.policy.max);
        self.current = self.policy.grow(base);
        self.policy.jittered(base)
    }

    /// Restart the sequence at the initial delay.
    pub fn reset(&mut self) {
        self.current = self.policy.initial;
        self.last_backoff_start = None;
    }
}

// =============================================================================
// Timer
// =============================================================================

/// A single pending backoff deadline.
///
/// Unarmed means "not backing off". Cancelling an unarmed timer is a no-op.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    backoff: ExponentialBackoff,
    deadline: Option<Instant>,
}

impl BackoffTimer {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            backoff: ExponentialBackoff::new(policy),
            deadline: None,
        }
    }

    /// Arm the timer with the next delay in the sequence.
    ///
    /// Returns the chosen delay.
    pub fn arm(&mut self) -> Duration {
        let now = Instant::now();
        let delay = self.backoff.next_delay_at(now);
        self.deadline = Some(now + delay);
        delay
    }

    /// Disarm the timer. Safe to call when nothing is pending.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Disarm the timer and restart the delay sequence.
    pub fn reset(&mut self) {
        self.deadline = None;
        self.backoff.reset();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Sleep until `deadline`, or forever if there is none.
///
/// Intended as a `tokio::select!` branch for an optional timer.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
