//! Best-effort batch outcomes.
//!
//! Some reconcile steps act on many items and must not stop at the first
//! failure: side effects of the items that succeeded are kept, and the step
//! as a whole reports failure afterwards.

use std::fmt::Display;

use thiserror::Error;

/// Aggregate failure of a best-effort batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation}: {failed} of {attempted} failed (first: {first})")]
pub struct BatchError {
    pub operation: String,
    pub attempted: usize,
    pub failed: usize,
    pub first: String,
}

/// Per-item outcome accumulator.
#[derive(Debug, Clone)]
pub struct BatchOutcome<K> {
    operation: String,
    succeeded: Vec<K>,
    failures: Vec<(K, String)>,
}

impl<K> BatchOutcome<K> {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn record_ok(&mut self, item: K) {
        self.succeeded.push(item);
    }

    pub fn record_err(&mut self, item: K, err: impl Display) {
        self.failures.push((item, err.to_string()));
    }

    /// Record a `Result`, returning the success value if there was one.
    pub fn record<T, E: Display>(&mut self, item: K, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(v) => {
                self.record_ok(item);
                Some(v)
            }
            Err(e) => {
                self.record_err(item, e);
                None
            }
        }
    }

    pub fn succeeded(&self) -> &[K] {
        &self.succeeded
    }

    pub fn failures(&self) -> &[(K, String)] {
        &self.failures
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failures.len()
    }

    pub fn any_succeeded(&self) -> bool {
        !self.succeeded.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse into a single result. Any failure fails the batch.
    pub fn into_result(self) -> Result<Vec<K>, BatchError> {
        let attempted = self.attempted();
        match self.failures.into_iter().next() {
            None => Ok(self.succeeded),
            Some((_, first)) => Err(BatchError {
                operation: self.operation,
                attempted,
                failed: attempted - self.succeeded.len(),
                first,
            }),
        }
    }
}
