//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge a remote system (here, a cloud provider's view of an
//! instance's network interfaces) toward a desired state. Key concepts:
//!
//! - **Phase**: one step of a reconciliation pass. A phase either proceeds
//!   with a value, or reports that the state it was working from is stale
//!   and the pass must restart from a fresh snapshot.
//! - **Backoff**: after a genuine failure the loop waits an exponentially
//!   growing, jittered interval before retrying.
//! - **Recheck**: after a success the loop re-verifies the remote state at
//!   growing intervals, since remote APIs can serve stale reads.
//!
//! # Invariants
//!
//! - Timers never fire after being cancelled.
//! - Decisions are deterministic given the same inputs (jitter aside).

mod backoff;
mod batch;
mod recheck;

pub use backoff::{sleep_until_deadline, BackoffPolicy, BackoffTimer, ExponentialBackoff};
pub use batch::{BatchError, BatchOutcome};
pub use recheck::RecheckSchedule;

/// Result of a single reconciliation phase that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Phase<T> {
    /// The phase completed against a still-valid snapshot.
    Proceed(T),

    /// The phase changed remote state; the snapshot is stale and the pass
    /// must restart.
    Restart,
}

impl<T> Phase<T> {
    /// Returns true if the pass must restart.
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restart)
    }

    /// Map the carried value, preserving a restart.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Phase<U> {
        match self {
            Self::Proceed(v) => Phase::Proceed(f(v)),
            Self::Restart => Phase::Restart,
        }
    }

    /// Returns the carried value, or `None` on restart.
    pub fn proceeded(self) -> Option<T> {
        match self {
            Self::Proceed(v) => Some(v),
            Self::Restart => None,
        }
    }
}

/// Unwrap a `Phase`, returning `Ok(Phase::Restart)` from the enclosing
/// function when the phase asked for a restart.
///
/// The enclosing function must return `Result<Phase<_>, _>`.
#[macro_export]
macro_rules! proceed {
    ($phase:expr) => {
        match $phase {
            $crate::Phase::Proceed(v) => v,
            $crate::Phase::Restart => return Ok($crate::Phase::Restart),
        }
    };
}

/// Maximum number of restarts a single resync may take before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    fn two_phases(first: Phase<u32>) -> Result<Phase<u32>, ()> {
        let v = proceed!(first);
        Ok(Phase::Proceed(v + 1))
    }

    #[test]
    fn test_proceed_macro_short_circuits_restart() {
        assert_eq!(two_phases(Phase::Proceed(1)), Ok(Phase::Proceed(2)));
        assert_eq!(two_phases(Phase::Restart), Ok(Phase::Restart));
    }

    #[test]
    fn test_phase_map() {
        assert_eq!(Phase::Proceed(2).map(|v| v * 2), Phase::Proceed(4));
        assert!(Phase::<u32>::Restart.map(|v| v * 2).is_restart());
        assert_eq!(Phase::Proceed("x").proceeded(), Some("x"));
    }
}
