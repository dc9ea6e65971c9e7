//! Configuration for the secondary interface provisioner.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use eni_reconcile::DEFAULT_MAX_ATTEMPTS;
use ipnet::Ipv4Net;

/// Settings the provisioner itself needs.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Name of this node in the IPAM datastore.
    pub node_name: String,

    /// Deadline for each individual cloud or IPAM call.
    pub call_timeout: Duration,

    /// Where to write the local-subnets file, if anywhere.
    pub subnets_file: Option<PathBuf>,

    /// Whether to report the liveness watchdog check.
    pub liveness_enabled: bool,

    /// Restarts a single resync may take before giving up.
    pub max_attempts: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            call_timeout: Duration::from_secs(30),
            subnets_file: None,
            liveness_enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,

    /// Cloud call timeout in seconds.
    pub call_timeout_secs: u64,

    pub subnets_file: Option<PathBuf>,

    pub liveness_enabled: bool,

    /// JSON file holding the desired routes and pools.
    pub desired_state_file: PathBuf,

    /// How often the desired-state file is re-read, in seconds.
    pub poll_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Subnets seeded into the development cloud, as `id=cidr` pairs.
    pub dev_subnets: Vec<(String, Ipv4Net)>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps variable names to values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let node_name = lookup("ENI_AGENT_NODE_NAME").unwrap_or_else(|| "localhost".to_string());

        let call_timeout_secs = match lookup("ENI_AGENT_CALL_TIMEOUT_SECS") {
            Some(s) => s
                .parse()
                .with_context(|| format!("invalid ENI_AGENT_CALL_TIMEOUT_SECS: {s:?}"))?,
            None => 30,
        };

        let subnets_file = lookup("ENI_AGENT_SUBNETS_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let liveness_enabled = match lookup("ENI_AGENT_LIVENESS").as_deref() {
            None | Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => anyhow::bail!("invalid ENI_AGENT_LIVENESS: {other:?}"),
        };

        let desired_state_file = lookup("ENI_AGENT_DESIRED_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/eni-agent/desired.json"));

        let poll_interval_secs = lookup("ENI_AGENT_POLL_INTERVAL_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let log_level = lookup("ENI_AGENT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_subnets = parse_dev_subnets(
            &lookup("ENI_AGENT_DEV_SUBNETS")
                .unwrap_or_else(|| "subnet-dev=100.64.0.0/24".to_string()),
        )?;

        Ok(Self {
            node_name,
            call_timeout_secs,
            subnets_file,
            liveness_enabled,
            desired_state_file,
            poll_interval_secs,
            log_level,
            dev_subnets,
        })
    }

    /// The subset of settings the provisioner uses.
    pub fn provisioner(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            node_name: self.node_name.clone(),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            subnets_file: self.subnets_file.clone(),
            liveness_enabled: self.liveness_enabled,
            ..ProvisionerConfig::default()
        }
    }
}

fn parse_dev_subnets(raw: &str) -> Result<Vec<(String, Ipv4Net)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, cidr) = entry
                .split_once('=')
                .with_context(|| format!("dev subnet {entry:?} is not of the form id=cidr"))?;
            let cidr = cidr
                .parse()
                .with_context(|| format!("dev subnet {id} has invalid CIDR {cidr:?}"))?;
            Ok((id.to_string(), cidr))
        })
        .collect()
}
