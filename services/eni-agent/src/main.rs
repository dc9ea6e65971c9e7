//! Secondary interface provisioner agent
//!
//! Runs the provisioner against an in-memory cloud and IPAM seeded with a
//! development instance. The desired state comes from a JSON file that is
//! re-read periodically; every interface state the provisioner produces is
//! logged.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use eni_agent::cloud::{FakeCloud, InstanceNetworkInfo};
use eni_agent::config::Config;
use eni_agent::health::HealthAggregator;
use eni_agent::ipam::{InMemoryIpam, IntendedUse};
use eni_agent::types::DesiredStateFile;
use eni_agent::{DesiredState, SecondaryIfaceProvisioner};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEV_INSTANCE_ID: &str = "i-0dev0000000000001";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_name = %config.node_name,
        desired_state_file = %config.desired_state_file.display(),
        liveness = config.liveness_enabled,
        "Starting secondary interface agent"
    );

    // Development wiring: the cloud and IPAM are in-memory.
    let cloud = dev_cloud(&config)?;
    let ipam = InMemoryIpam::new();
    for (subnet_id, cidr) in &config.dev_subnets {
        ipam.add_pool(*cidr, IntendedUse::HostSecondary, Some(subnet_id));
    }
    let health = Arc::new(HealthAggregator::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let capacity_log: eni_agent::CapacityCallback = Arc::new(|caps| {
        debug!(max_secondary_ips = caps.max_calico_secondary_ips, "Secondary address capacity");
    });
    let mut provisioner = SecondaryIfaceProvisioner::new(
        config.provisioner(),
        Arc::new(cloud),
        Arc::new(ipam),
        health.clone(),
    )
    .with_capacity_callback(capacity_log);
    if let Some(path) = &config.subnets_file {
        provisioner = provisioner.with_subnets_file(path);
    }
    let mut handle = provisioner.start(shutdown_rx);

    let mut poll = tokio::time::interval(Duration::from_secs(config.poll_interval_secs.max(1)));
    let mut last_desired: Option<DesiredState> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = poll.tick() => {
                match load_desired_state(&config.desired_state_file).await {
                    Ok(desired) if last_desired.as_ref() != Some(&desired) => {
                        info!(
                            routes = desired.routes_by_destination.len(),
                            "Desired state changed"
                        );
                        handle.on_datastore_update(desired.clone());
                        last_desired = Some(desired);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        error = %e,
                        "Failed to load desired state, keeping the previous one"
                    ),
                }
            }
            state = handle.recv() => {
                let Some(state) = state else {
                    error!("Provisioner exited unexpectedly");
                    break;
                };
                info!(
                    primary_mac = ?state.primary_mac.as_ref().map(ToString::to_string),
                    subnet = ?state.subnet_cidr.map(|c| c.to_string()),
                    gateway = ?state.gateway,
                    secondary_ifaces = state.secondary_ifaces_by_mac.len(),
                    secondary_addrs = ?state.secondary_addresses(),
                    "Secondary interface state"
                );
            }
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Waiting for provisioner to shut down...");
    if let Err(e) = handle.join().await {
        error!(error = %e, "Provisioner task panicked");
    }

    let summary = health.summary();
    info!(
        ready = summary.ready,
        live = summary.live,
        failing = ?summary.failing,
        "Agent shutdown complete"
    );
    Ok(())
}

/// Seed a development instance: a primary interface in the first dev subnet.
fn dev_cloud(config: &Config) -> Result<FakeCloud> {
    let cloud = FakeCloud::new(
        DEV_INSTANCE_ID,
        "t3.large",
        InstanceNetworkInfo {
            max_network_interfaces: 3,
            ipv4_per_interface: 12,
            network_card_limits: vec![3],
        },
    );
    let (primary_subnet, primary_cidr) = config
        .dev_subnets
        .first()
        .context("at least one development subnet is required")?;
    for (subnet_id, cidr) in &config.dev_subnets {
        cloud.add_subnet(subnet_id, *cidr);
    }
    let primary_addr = primary_cidr
        .hosts()
        .last()
        .context("development subnet has no host addresses")?;
    cloud.add_primary_interface(primary_subnet, primary_addr, &["sg-dev"]);
    Ok(cloud)
}

async fn load_desired_state(path: &Path) -> Result<DesiredState> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DesiredState::default()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let file: DesiredStateFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.into())
}
