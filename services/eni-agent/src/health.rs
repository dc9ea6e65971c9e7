//! Health reporting.
//!
//! The provisioner publishes readiness and liveness through a [`HealthSink`].
//! [`HealthAggregator`] is the in-process sink: it keeps the latest report of
//! each check and folds them into an overall summary.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Readiness check: false while the instance cannot hold every desired
/// address.
pub const HEALTH_ENI_CAPACITY: &str = "aws-eni-capacity";

/// Readiness check: false while the last resync failed.
pub const HEALTH_IN_SYNC: &str = "aws-eni-addresses-in-sync";

/// Liveness watchdog of the reconciliation loop.
pub const HEALTH_PROVISIONER: &str = "aws-eni-provisioner";

/// A single health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub ready: bool,
    pub live: bool,
}

impl HealthReport {
    pub const HEALTHY: Self = Self {
        ready: true,
        live: true,
    };

    /// A readiness report; readiness checks never affect liveness.
    pub const fn ready(ready: bool) -> Self {
        Self { ready, live: true }
    }
}

/// Destination for health reports.
pub trait HealthSink: Send + Sync {
    /// Register a check with its initial report.
    ///
    /// A check with a timeout is considered not live once its last report is
    /// older than the timeout.
    fn register_check(&self, name: &str, default: HealthReport, timeout: Option<Duration>);

    fn report(&self, name: &str, report: HealthReport);
}

#[derive(Debug, Clone)]
struct CheckState {
    report: HealthReport,
    timeout: Option<Duration>,
    updated: DateTime<Utc>,
}

/// Overall health derived from every registered check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub ready: bool,
    pub live: bool,
    /// Names of checks that are not ready or not live.
    pub failing: Vec<String>,
}

/// In-process [`HealthSink`].
#[derive(Debug, Default)]
pub struct HealthAggregator {
    checks: Mutex<BTreeMap<String, CheckState>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn checks(&self) -> MutexGuard<'_, BTreeMap<String, CheckState>> {
        self.checks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest report of a check.
    pub fn get(&self, name: &str) -> Option<HealthReport> {
        self.checks().get(name).map(|c| c.report)
    }

    /// When a check last reported.
    pub fn last_updated(&self, name: &str) -> Option<DateTime<Utc>> {
        self.checks().get(name).map(|c| c.updated)
    }

    pub fn summary(&self) -> HealthSummary {
        self.summary_at(Utc::now())
    }

    /// Summary as of `now`.
    pub fn summary_at(&self, now: DateTime<Utc>) -> HealthSummary {
        let mut summary = HealthSummary {
            ready: true,
            live: true,
            failing: Vec::new(),
        };
        for (name, check) in self.checks().iter() {
            let stale = check.timeout.is_some_and(|timeout| {
                chrono::Duration::from_std(timeout)
                    .map(|t| now - check.updated > t)
                    .unwrap_or(false)
            });
            let live = check.report.live && !stale;
            summary.ready &= check.report.ready;
            summary.live &= live;
            if !check.report.ready || !live {
                summary.failing.push(name.clone());
            }
        }
        summary
    }
}

impl HealthSink for HealthAggregator {
    fn register_check(&self, name: &str, default: HealthReport, timeout: Option<Duration>) {
        self.checks().insert(
            name.to_string(),
            CheckState {
                report: default,
                timeout,
                updated: Utc::now(),
            },
        );
    }

    fn report(&self, name: &str, report: HealthReport) {
        let mut checks = self.checks();
        match checks.get_mut(name) {
            Some(check) => {
                if check.report != report {
                    debug!(
                        check = name,
                        ready = report.ready,
                        live = report.live,
                        "Health changed"
                    );
                }
                check.report = report;
                check.updated = Utc::now();
            }
            None => debug!(check = name, "Report for unregistered check ignored"),
        }
    }
}
