//! Resync error types.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use eni_networking::NetworkError;
use eni_reconcile::BatchError;
use thiserror::Error;

use crate::cloud::CloudError;
use crate::ipam::IpamError;

/// Why a resync failed.
#[derive(Debug, Error)]
pub enum ResyncError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    /// A collaborator call exceeded the per-call timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("interface {iface_id} has no MAC address")]
    MissingMac { iface_id: String },

    #[error("no primary interface attached to this instance")]
    NoPrimaryInterface,

    #[error("subnet {subnet_id} has no CIDR block")]
    SubnetMissingCidr { subnet_id: String },

    #[error("instance type supports no secondary addresses ({max_ipv4_per_interface} per iface)")]
    NoSecondaryAddressSupport { max_ipv4_per_interface: usize },

    /// Some items of a batch operation failed.
    #[error(transparent)]
    PartialFailure(#[from] BatchError),

    #[error("resync did not converge after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("resync cancelled")]
    Cancelled,

    #[error("failed to write subnets file {path}: {source}")]
    SubnetsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResyncError {
    /// Returns true if the error came from shutdown rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
