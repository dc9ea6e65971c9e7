//! Cloud provider interface.
//!
//! The cloud interface abstracts the handful of network-interface API calls
//! the provisioner needs:
//! - Listing the interfaces attached to this instance and the subnets local
//!   to its availability zone
//! - Creating, attaching, detaching and deleting secondary interfaces
//! - Assigning and unassigning secondary private addresses
//!
//! An in-memory implementation ([`FakeCloud`]) is provided for testing and
//! development.

mod fake;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use fake::{CloudCall, CloudOp, FakeCloud};

/// Tag key marking what an interface is used for.
pub const TAG_USE: &str = "calico:use";

/// Value of [`TAG_USE`] on interfaces this provisioner owns.
pub const USE_SECONDARY: &str = "secondary";

/// Tag key recording the instance an owned interface was created for.
pub const TAG_OWNING_INSTANCE: &str = "calico:instance";

/// Description given to newly created interfaces.
pub fn interface_description(instance_id: &str) -> String {
    format!("Calico secondary NIC for instance {instance_id}")
}

/// Tags given to newly created interfaces.
pub fn owned_interface_tags(instance_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TAG_USE.to_string(), USE_SECONDARY.to_string()),
        (TAG_OWNING_INSTANCE.to_string(), instance_id.to_string()),
    ])
}

/// Cloud API errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// The referenced resource does not exist.
    #[error("{operation}: {what} not found")]
    NotFound {
        operation: &'static str,
        what: String,
    },

    /// The request was rejected.
    #[error("{operation}: invalid parameter: {reason}")]
    InvalidParameter {
        operation: &'static str,
        reason: String,
    },

    /// Credentials were missing or lacked permission.
    #[error("{operation}: access denied")]
    Unauthorized { operation: &'static str },

    /// The request never got a response.
    #[error("{operation}: transport error: {reason}")]
    Transport {
        operation: &'static str,
        reason: String,
    },
}

/// A private IPv4 address on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateAddress {
    pub address: Ipv4Addr,
    pub primary: bool,
}

/// Where and how an interface is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub device_index: u32,
    pub network_card_index: u32,
    pub delete_on_termination: bool,
}

/// Lifecycle status of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    /// Not attached to any instance.
    Available,
    /// Attached to an instance.
    InUse,
}

/// A network interface as reported by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub id: String,
    pub subnet_id: String,
    pub description: String,
    pub mac_address: Option<String>,
    pub private_addresses: Vec<PrivateAddress>,
    pub attachment: Option<Attachment>,
    pub security_groups: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub status: InterfaceStatus,
}

impl NetworkInterface {
    /// Returns true if this provisioner created (and manages) the interface.
    pub fn is_owned(&self) -> bool {
        self.tags.get(TAG_USE).map(String::as_str) == Some(USE_SECONDARY)
    }

    /// The instance recorded on an owned interface, if any.
    pub fn owning_instance(&self) -> Option<&str> {
        self.tags.get(TAG_OWNING_INSTANCE).map(String::as_str)
    }

    /// Network card the interface is attached to; unattached counts as 0.
    pub fn network_card_index(&self) -> u32 {
        self.attachment
            .as_ref()
            .map(|a| a.network_card_index)
            .unwrap_or(0)
    }

    /// The interface's primary address.
    ///
    /// Falls back to the first listed address when none is flagged primary.
    pub fn primary_address(&self) -> Option<Ipv4Addr> {
        self.private_addresses
            .iter()
            .find(|a| a.primary)
            .or_else(|| self.private_addresses.first())
            .map(|a| a.address)
    }

    /// Secondary addresses, in cloud order.
    pub fn secondary_addresses(&self) -> Vec<Ipv4Addr> {
        let primary = self.primary_address();
        self.private_addresses
            .iter()
            .map(|a| a.address)
            .filter(|a| Some(*a) != primary)
            .collect()
    }
}

/// A subnet as reported by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub cidr_block: Option<String>,
    pub availability_zone: String,
}

/// Network limits of an instance type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceNetworkInfo {
    /// Maximum interfaces across all network cards.
    pub max_network_interfaces: usize,

    /// Maximum IPv4 addresses per interface, primary included.
    pub ipv4_per_interface: usize,

    /// Maximum interfaces per network card, by card index.
    pub network_card_limits: Vec<usize>,
}

/// Parameters for creating an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInterfaceRequest {
    pub subnet_id: String,
    pub description: String,
    pub security_groups: Vec<String>,
    pub primary_address: Ipv4Addr,
    pub tags: BTreeMap<String, String>,
}

/// Network interface operations against the cloud provider.
///
/// Every call may fail; callers bound each call with their own deadline.
#[async_trait]
pub trait CloudInterfaceClient: Send + Sync {
    /// The instance this client acts for.
    fn instance_id(&self) -> &str;

    /// The type of this instance.
    async fn my_instance_type(&self) -> Result<String, CloudError>;

    /// Network limits of the given instance type.
    async fn instance_network_capability(
        &self,
        instance_type: &str,
    ) -> Result<InstanceNetworkInfo, CloudError>;

    /// All interfaces attached to this instance.
    async fn list_my_network_interfaces(&self) -> Result<Vec<NetworkInterface>, CloudError>;

    /// Subnets in this instance's VPC and availability zone.
    async fn list_az_local_subnets(&self) -> Result<Vec<Subnet>, CloudError>;

    async fn create_interface(
        &self,
        request: CreateInterfaceRequest,
    ) -> Result<NetworkInterface, CloudError>;

    /// Attach an interface to this instance. Returns the attachment ID.
    async fn attach_interface(
        &self,
        interface_id: &str,
        device_index: u32,
        network_card_index: u32,
    ) -> Result<String, CloudError>;

    async fn detach_interface(&self, attachment_id: &str, force: bool) -> Result<(), CloudError>;

    async fn delete_interface(&self, interface_id: &str) -> Result<(), CloudError>;

    async fn assign_addresses(
        &self,
        interface_id: &str,
        addresses: &[Ipv4Addr],
        allow_reassignment: bool,
    ) -> Result<(), CloudError>;

    async fn unassign_addresses(
        &self,
        interface_id: &str,
        addresses: &[Ipv4Addr],
    ) -> Result<(), CloudError>;

    /// Owned interfaces tagged with `instance_id` that are not attached
    /// anywhere.
    async fn list_unattached_owned_interfaces(
        &self,
        instance_id: &str,
    ) -> Result<Vec<NetworkInterface>, CloudError>;

    /// Ensure the interface is deleted along with the instance.
    async fn set_delete_on_termination(
        &self,
        interface_id: &str,
        attachment_id: &str,
    ) -> Result<(), CloudError>;
}

/// Creates cloud client handles.
#[async_trait]
pub trait CloudClientFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CloudInterfaceClient>, CloudError>;
}
