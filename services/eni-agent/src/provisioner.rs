//! Reconciliation loop.
//!
//! The loop owns the [`ResyncEngine`] and multiplexes its event sources:
//!
//! - **Updates**: a new desired state from the datastore. Latest value wins.
//! - **Backoff**: retry after a failed resync.
//! - **Recheck**: re-verify cloud state after a successful resync, since
//!   the cloud API can serve stale reads or drop writes.
//! - **Liveness**: periodic watchdog report.
//! - **Response**: hand the pending result to the consumer.
//!
//! Only updates and the two timers trigger a resync.

use std::sync::Arc;
use std::time::Duration;

use eni_reconcile::{sleep_until_deadline, BackoffPolicy, BackoffTimer, RecheckSchedule};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cloud::CloudClientFactory;
use crate::config::ProvisionerConfig;
use crate::engine::{CapacityCallback, ResyncEngine};
use crate::health::{
    HealthReport, HealthSink, HEALTH_ENI_CAPACITY, HEALTH_IN_SYNC, HEALTH_PROVISIONER,
};
use crate::ipam::IpamClient;
use crate::types::{DesiredState, IfaceState};

/// How often the liveness check is reported.
pub const LIVENESS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// How long the liveness check may go unreported before it counts as failed.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Keeps this instance's secondary interfaces in line with the desired state.
pub struct SecondaryIfaceProvisioner {
    engine: ResyncEngine,
    health: Arc<dyn HealthSink>,
    liveness_enabled: bool,
    backoff: BackoffTimer,
    recheck: RecheckSchedule,
}

impl SecondaryIfaceProvisioner {
    /// Create a provisioner and register its health checks.
    pub fn new(
        config: ProvisionerConfig,
        factory: Arc<dyn CloudClientFactory>,
        ipam: Arc<dyn IpamClient>,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        health.register_check(HEALTH_ENI_CAPACITY, HealthReport::HEALTHY, None);
        health.register_check(HEALTH_IN_SYNC, HealthReport::HEALTHY, None);
        if config.liveness_enabled {
            health.register_check(
                HEALTH_PROVISIONER,
                HealthReport::HEALTHY,
                Some(LIVENESS_TIMEOUT),
            );
        }

        Self {
            engine: ResyncEngine::new(&config, factory, ipam, Arc::clone(&health)),
            health,
            liveness_enabled: config.liveness_enabled,
            backoff: BackoffTimer::new(BackoffPolicy::default()),
            recheck: RecheckSchedule::default(),
        }
    }

    /// Receive the capacity figures computed on each resync attempt.
    pub fn with_capacity_callback(mut self, callback: CapacityCallback) -> Self {
        self.engine = self.engine.with_capacity_callback(callback);
        self
    }

    /// Write the local-subnets file to `path`.
    pub fn with_subnets_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.engine = self.engine.with_subnets_file(path);
        self
    }

    pub fn with_backoff_policy(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = BackoffTimer::new(policy);
        self
    }

    pub fn with_recheck_policy(mut self, policy: BackoffPolicy) -> Self {
        self.recheck = RecheckSchedule::new(policy);
        self
    }

    /// Spawn the reconciliation loop.
    ///
    /// Nothing happens until the first desired state arrives. The loop stops
    /// when `shutdown` turns true or the handle is dropped.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> ProvisionerHandle {
        let (updates_tx, updates_rx) = watch::channel(DesiredState::default());
        let (responses_tx, responses_rx) = mpsc::channel(1);
        let done = tokio::spawn(self.run(updates_rx, responses_tx, shutdown));
        ProvisionerHandle {
            updates: updates_tx,
            responses: responses_rx,
            done,
        }
    }

    async fn run(
        mut self,
        mut updates: watch::Receiver<DesiredState>,
        responses: mpsc::Sender<IfaceState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(liveness = self.liveness_enabled, "Starting secondary interface provisioner");

        let mut liveness = tokio::time::interval(LIVENESS_REPORT_INTERVAL);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Only the most recent result is ever delivered.
        let mut pending: Option<IfaceState> = None;

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("Provisioner shutting down");
                        break;
                    }
                    continue;
                }
                res = updates.changed() => {
                    if res.is_err() {
                        info!("Desired state updates closed, provisioner stopping");
                        break;
                    }
                    let desired = updates.borrow_and_update().clone();
                    debug!(
                        routes = desired.routes_by_destination.len(),
                        subnets_with_pools = desired.pool_ids_by_subnet.len(),
                        "Received desired state update"
                    );
                    self.engine.set_desired(desired);
                    self.backoff.cancel();
                }
                permit = responses.reserve(), if pending.is_some() => {
                    match (permit, pending.take()) {
                        (Ok(permit), Some(state)) => permit.send(state),
                        (Err(_), _) => debug!("No response receiver, dropping result"),
                        (Ok(_), None) => {}
                    }
                    continue;
                }
                _ = liveness.tick(), if self.liveness_enabled => {
                    self.health.report(HEALTH_PROVISIONER, HealthReport::HEALTHY);
                    continue;
                }
                _ = sleep_until_deadline(self.backoff.deadline()) => {
                    debug!("Backoff expired, retrying resync");
                    self.backoff.cancel();
                    self.engine.mark_resync_needed();
                }
                _ = sleep_until_deadline(self.recheck.deadline()) => {
                    debug!("Rechecking cloud state");
                    self.recheck.stop();
                    self.engine.mark_resync_needed();
                }
            }

            if !self.engine.resync_needed() {
                continue;
            }

            self.recheck.stop();
            match self.engine.resync(&shutdown).await {
                Ok(state) => {
                    self.health.report(HEALTH_IN_SYNC, HealthReport::ready(true));
                    if self.engine.take_recheck_reset() {
                        self.recheck.reset_interval();
                    }
                    let recheck_in = self.recheck.reschedule();
                    debug!(recheck_in = ?recheck_in, "Resync succeeded");
                    pending = Some(state);
                }
                Err(e) if e.is_cancelled() => {
                    info!("Resync interrupted by shutdown");
                    break;
                }
                Err(e) => {
                    self.health.report(HEALTH_IN_SYNC, HealthReport::ready(false));
                    self.engine.take_recheck_reset();
                    self.recheck.reset_interval();
                    let retry_in = self.backoff.arm();
                    warn!(error = %e, retry_in = ?retry_in, "Resync failed, backing off");
                }
            }
        }
    }
}

/// Handle to a running provisioner.
///
/// Dropping the handle stops the loop.
#[derive(Debug)]
pub struct ProvisionerHandle {
    updates: watch::Sender<DesiredState>,
    responses: mpsc::Receiver<IfaceState>,
    done: JoinHandle<()>,
}

impl ProvisionerHandle {
    /// Replace the desired state. Never blocks; an update not yet seen by the
    /// loop is superseded.
    pub fn on_datastore_update(&self, desired: DesiredState) {
        self.updates.send_replace(desired);
    }

    /// Wait for the next interface state.
    ///
    /// Returns `None` once the loop has stopped.
    pub async fn recv(&mut self) -> Option<IfaceState> {
        self.responses.recv().await
    }

    pub fn try_recv(&mut self) -> Option<IfaceState> {
        self.responses.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_finished()
    }

    /// Stop feeding updates and wait for the loop to exit.
    pub async fn join(self) -> Result<(), JoinError> {
        let Self {
            updates,
            responses,
            done,
        } = self;
        drop(updates);
        drop(responses);
        done.await
    }
}
