//! Secondary network interface provisioner.
//!
//! Workloads on this node get addresses from IP pools backed by cloud
//! subnets. For that traffic to be routable, every such address has to be
//! attached to the instance as a secondary address of some network interface.
//! The provisioner keeps the instance's interfaces in line with the set of
//! local workload addresses:
//!
//! - **Engine** ([`engine`]): one resync converges cloud state toward the
//!   desired state, releasing unwanted addresses and interfaces, creating new
//!   interfaces and assigning missing addresses.
//! - **Loop** ([`provisioner`]): reacts to desired-state updates, retries
//!   failed resyncs with backoff and rechecks successful ones periodically.
//! - **Collaborators**: the cloud API ([`cloud`]), IPAM ([`ipam`]) and health
//!   reporting ([`health`]) sit behind traits, with in-memory
//!   implementations for tests and development.

pub mod capability;
pub mod cloud;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod ipam;
pub mod provisioner;
pub mod snapshot;
pub mod subnet;
pub mod subnets_file;
pub mod types;

pub use config::ProvisionerConfig;
pub use engine::{CapacityCallback, ResyncEngine};
pub use error::ResyncError;
pub use provisioner::{ProvisionerHandle, SecondaryIfaceProvisioner};
pub use types::{DesiredState, Iface, IfaceState, SecondaryIfaceCapacities};
