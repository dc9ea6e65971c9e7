//! In-memory cloud for testing and development.
//!
//! Models a single instance with one or more network cards, a set of
//! subnets and the interfaces in them. It enforces the same constraints the
//! real API does where the provisioner depends on them: per-card device
//! indexes are unique, interfaces must be detached before deletion, and
//! interfaces hold a bounded number of addresses.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::{debug, info};

use super::{
    interface_description, owned_interface_tags, Attachment, CloudClientFactory, CloudError,
    CloudInterfaceClient, CreateInterfaceRequest, InstanceNetworkInfo, InterfaceStatus,
    NetworkInterface, PrivateAddress, Subnet,
};

const DEFAULT_AVAILABILITY_ZONE: &str = "us-west-2a";

/// A cloud API operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CloudOp {
    Connect,
    InstanceType,
    NetworkCapability,
    ListInterfaces,
    ListSubnets,
    CreateInterface,
    AttachInterface,
    DetachInterface,
    DeleteInterface,
    AssignAddresses,
    UnassignAddresses,
    ListUnattached,
    SetDeleteOnTermination,
}

impl CloudOp {
    /// Returns true if the operation changes cloud state.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::CreateInterface
                | Self::AttachInterface
                | Self::DetachInterface
                | Self::DeleteInterface
                | Self::AssignAddresses
                | Self::UnassignAddresses
                | Self::SetDeleteOnTermination
        )
    }
}

/// A recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCall {
    pub op: CloudOp,
    /// Interface, attachment or subnet the call acted on.
    pub target: String,
    pub addresses: Vec<Ipv4Addr>,
}

#[derive(Debug)]
struct State {
    instance_type: String,
    availability_zone: String,
    network_info: InstanceNetworkInfo,
    interfaces: BTreeMap<String, NetworkInterface>,
    subnets: BTreeMap<String, (Subnet, Option<Ipv4Net>)>,
    next_interface: u64,
    next_attachment: u64,
    calls: Vec<CloudCall>,
    injected: Vec<(CloudOp, CloudError)>,
    lost_assigns: usize,
    connects: usize,
    latency: Duration,
}

impl State {
    /// Record a call and consume any failure injected for it.
    fn record(
        &mut self,
        op: CloudOp,
        target: &str,
        addresses: &[Ipv4Addr],
    ) -> Result<(), CloudError> {
        self.calls.push(CloudCall {
            op,
            target: target.to_string(),
            addresses: addresses.to_vec(),
        });
        match self.injected.iter().position(|(o, _)| *o == op) {
            Some(pos) => Err(self.injected.remove(pos).1),
            None => Ok(()),
        }
    }

    fn card_limit(&self, card: u32) -> usize {
        self.network_info
            .network_card_limits
            .get(card as usize)
            .copied()
            .unwrap_or(self.network_info.max_network_interfaces)
    }

    fn attached(&self) -> impl Iterator<Item = &NetworkInterface> {
        self.interfaces.values().filter(|i| i.attachment.is_some())
    }

    fn lowest_free_device_index(&self, card: u32) -> u32 {
        let mut idx = 0;
        while self.attached().any(|i| {
            i.attachment
                .as_ref()
                .is_some_and(|a| a.network_card_index == card && a.device_index == idx)
        }) {
            idx += 1;
        }
        idx
    }

    fn address_owner(&self, addr: Ipv4Addr) -> Option<(&str, bool)> {
        self.interfaces.values().find_map(|i| {
            i.private_addresses
                .iter()
                .find(|a| a.address == addr)
                .map(|a| (i.id.as_str(), a.primary))
        })
    }

    fn new_interface_id(&mut self) -> (String, String) {
        let n = self.next_interface;
        self.next_interface += 1;
        let [_, _, _, _, _, a, b, c] = n.to_be_bytes();
        (
            format!("eni-{n:017x}"),
            format!("02:00:00:{a:02x}:{b:02x}:{c:02x}"),
        )
    }

    fn new_attachment(&mut self, device_index: u32, network_card_index: u32) -> Attachment {
        let n = self.next_attachment;
        self.next_attachment += 1;
        Attachment {
            id: format!("eni-attach-{n:017x}"),
            device_index,
            network_card_index,
            delete_on_termination: false,
        }
    }
}

/// In-memory cloud shared between the provisioner and the test driving it.
///
/// Cloning yields another handle to the same simulated cloud.
#[derive(Debug, Clone)]
pub struct FakeCloud {
    instance_id: Arc<str>,
    state: Arc<Mutex<State>>,
}

impl FakeCloud {
    /// Create a cloud holding one instance of the given type.
    pub fn new(instance_id: &str, instance_type: &str, network_info: InstanceNetworkInfo) -> Self {
        Self {
            instance_id: Arc::from(instance_id),
            state: Arc::new(Mutex::new(State {
                instance_type: instance_type.to_string(),
                availability_zone: DEFAULT_AVAILABILITY_ZONE.to_string(),
                network_info,
                interfaces: BTreeMap::new(),
                subnets: BTreeMap::new(),
                next_interface: 1,
                next_attachment: 1,
                calls: Vec::new(),
                injected: Vec::new(),
                lost_assigns: 0,
                connects: 0,
                latency: Duration::ZERO,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Add a subnet in this instance's availability zone.
    pub fn add_subnet(&self, id: &str, cidr: Ipv4Net) {
        let az = self.state().availability_zone.clone();
        self.add_subnet_in_zone(id, Some(cidr), &az);
    }

    /// Add a subnet in an arbitrary zone, optionally without a CIDR block.
    pub fn add_subnet_in_zone(&self, id: &str, cidr: Option<Ipv4Net>, availability_zone: &str) {
        let subnet = Subnet {
            id: id.to_string(),
            cidr_block: cidr.map(|c| c.to_string()),
            availability_zone: availability_zone.to_string(),
        };
        self.state()
            .subnets
            .insert(id.to_string(), (subnet, cidr));
    }

    /// Add the instance's primary interface at device index 0.
    pub fn add_primary_interface(
        &self,
        subnet_id: &str,
        address: Ipv4Addr,
        security_groups: &[&str],
    ) -> String {
        let mut state = self.state();
        let (id, mac) = state.new_interface_id();
        let mut attachment = state.new_attachment(0, 0);
        attachment.delete_on_termination = true;
        state.interfaces.insert(
            id.clone(),
            NetworkInterface {
                id: id.clone(),
                subnet_id: subnet_id.to_string(),
                description: "Primary network interface".to_string(),
                mac_address: Some(mac),
                private_addresses: vec![PrivateAddress {
                    address,
                    primary: true,
                }],
                attachment: Some(attachment),
                security_groups: security_groups.iter().map(|s| s.to_string()).collect(),
                tags: BTreeMap::new(),
                status: InterfaceStatus::InUse,
            },
        );
        id
    }

    /// Add an owned interface attached at the lowest free device index of
    /// card 0.
    pub fn add_owned_interface(
        &self,
        subnet_id: &str,
        primary: Ipv4Addr,
        secondaries: &[Ipv4Addr],
    ) -> String {
        let mut state = self.state();
        let idx = state.lowest_free_device_index(0);
        let mut attachment = state.new_attachment(idx, 0);
        attachment.delete_on_termination = true;
        let (id, mac) = state.new_interface_id();
        let iface =
            self.owned_interface(&id, &mac, subnet_id, primary, secondaries, Some(attachment));
        state.interfaces.insert(id.clone(), iface);
        id
    }

    /// Add an owned interface that is not attached to anything.
    pub fn add_unattached_owned_interface(&self, subnet_id: &str, primary: Ipv4Addr) -> String {
        let mut state = self.state();
        let (id, mac) = state.new_interface_id();
        let iface = self.owned_interface(&id, &mac, subnet_id, primary, &[], None);
        state.interfaces.insert(id.clone(), iface);
        id
    }

    fn owned_interface(
        &self,
        id: &str,
        mac: &str,
        subnet_id: &str,
        primary: Ipv4Addr,
        secondaries: &[Ipv4Addr],
        attachment: Option<Attachment>,
    ) -> NetworkInterface {
        let mut private_addresses = vec![PrivateAddress {
            address: primary,
            primary: true,
        }];
        private_addresses.extend(secondaries.iter().map(|a| PrivateAddress {
            address: *a,
            primary: false,
        }));
        let status = if attachment.is_some() {
            InterfaceStatus::InUse
        } else {
            InterfaceStatus::Available
        };
        NetworkInterface {
            id: id.to_string(),
            subnet_id: subnet_id.to_string(),
            description: interface_description(&self.instance_id),
            mac_address: Some(mac.to_string()),
            private_addresses,
            attachment,
            security_groups: Vec::new(),
            tags: owned_interface_tags(&self.instance_id),
            status,
        }
    }

    /// Insert or replace an interface verbatim.
    pub fn insert_interface(&self, iface: NetworkInterface) {
        self.state().interfaces.insert(iface.id.clone(), iface);
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: CloudOp, err: CloudError) {
        self.state().injected.push((op, err));
    }

    /// Report success for the next address assignment without applying it.
    pub fn lose_next_assign(&self) {
        self.state().lost_assigns += 1;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn interface(&self, id: &str) -> Option<NetworkInterface> {
        self.state().interfaces.get(id).cloned()
    }

    pub fn interfaces(&self) -> Vec<NetworkInterface> {
        self.state().interfaces.values().cloned().collect()
    }

    pub fn attached_interfaces(&self) -> Vec<NetworkInterface> {
        self.state().attached().cloned().collect()
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.state().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<CloudCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op.is_mutating())
            .cloned()
            .collect()
    }

    pub fn call_count(&self, op: CloudOp) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of client handles requested so far.
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }
}

#[async_trait]
impl CloudInterfaceClient for FakeCloud {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn my_instance_type(&self) -> Result<String, CloudError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::InstanceType, &self.instance_id, &[])?;
        Ok(state.instance_type.clone())
    }

    async fn instance_network_capability(
        &self,
        instance_type: &str,
    ) -> Result<InstanceNetworkInfo, CloudError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::NetworkCapability, instance_type, &[])?;
        if instance_type != state.instance_type {
            return Err(CloudError::NotFound {
                operation: "DescribeInstanceTypes",
                what: format!("instance type {instance_type}"),
            });
        }
        Ok(state.network_info.clone())
    }

    async fn list_my_network_interfaces(&self) -> Result<Vec<NetworkInterface>, CloudError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::ListInterfaces, &self.instance_id, &[])?;
        Ok(state.attached().cloned().collect())
    }

    async fn list_az_local_subnets(&self) -> Result<Vec<Subnet>, CloudError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::ListSubnets, &self.instance_id, &[])?;
        let az = state.availability_zone.clone();
        Ok(state
            .subnets
            .values()
            .filter(|(s, _)| s.availability_zone == az)
            .map(|(s, _)| s.clone())
            .collect())
    }

    async fn create_interface(
        &self,
        request: CreateInterfaceRequest,
    ) -> Result<NetworkInterface, CloudError> {
        const OP: &str = "CreateNetworkInterface";
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::CreateInterface, &request.subnet_id, &[request.primary_address])?;

        let Some((_, cidr)) = state.subnets.get(&request.subnet_id) else {
            return Err(CloudError::NotFound {
                operation: OP,
                what: format!("subnet {}", request.subnet_id),
            });
        };
        if let Some(cidr) = cidr {
            if !cidr.contains(&request.primary_address) {
                return Err(CloudError::InvalidParameter {
                    operation: OP,
                    reason: format!("{} is outside {}", request.primary_address, cidr),
                });
            }
        }
        if state.address_owner(request.primary_address).is_some() {
            return Err(CloudError::InvalidParameter {
                operation: OP,
                reason: format!("{} is already in use", request.primary_address),
            });
        }

        let (id, mac) = state.new_interface_id();
        let iface = NetworkInterface {
            id: id.clone(),
            subnet_id: request.subnet_id,
            description: request.description,
            mac_address: Some(mac),
            private_addresses: vec![PrivateAddress {
                address: request.primary_address,
                primary: true,
            }],
            attachment: None,
            security_groups: request.security_groups,
            tags: request.tags,
            status: InterfaceStatus::Available,
        };
        debug!(iface_id = %id, "[FAKE] Created interface");
        state.interfaces.insert(id, iface.clone());
        Ok(iface)
    }

    async fn attach_interface(
        &self,
        interface_id: &str,
        device_index: u32,
        network_card_index: u32,
    ) -> Result<String, CloudError> {
        const OP: &str = "AttachNetworkInterface";
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::AttachInterface, interface_id, &[])?;

        let Some(iface) = state.interfaces.get(interface_id) else {
            return Err(CloudError::NotFound {
                operation: OP,
                what: format!("interface {interface_id}"),
            });
        };
        if iface.attachment.is_some() {
            return Err(CloudError::InvalidParameter {
                operation: OP,
                reason: format!("{interface_id} is already attached"),
            });
        }
        if device_index as usize >= state.card_limit(network_card_index) {
            return Err(CloudError::InvalidParameter {
                operation: OP,
                reason: format!("device index {device_index} out of range"),
            });
        }
        if state.attached().count() >= state.network_info.max_network_interfaces {
            return Err(CloudError::InvalidParameter {
                operation: OP,
                reason: "interface limit reached".to_string(),
            });
        }
        let conflict = state.attached().any(|i| {
            i.attachment.as_ref().is_some_and(|a| {
                a.network_card_index == network_card_index && a.device_index == device_index
            })
        });
        if conflict {
            return Err(CloudError::InvalidParameter {
                operation: OP,
                reason: format!("device index {device_index} already in use"),
            });
        }

        let attachment = state.new_attachment(device_index, network_card_index);
        let attachment_id = attachment.id.clone();
        if let Some(iface) = state.interfaces.get_mut(interface_id) {
            iface.attachment = Some(attachment);
            iface.status = InterfaceStatus::InUse;
        }
        info!(iface_id = %interface_id, device_index, "[FAKE] Attached interface");
        Ok(attachment_id)
    }

    async fn detach_interface(&self, attachment_id: &str, _force: bool) -> Result<(), CloudError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::DetachInterface, attachment_id, &[])?;

        let iface = state
            .interfaces
            .values_mut()
            .find(|i| i.attachment.as_ref().is_some_and(|a| a.id == attachment_id))
            .ok_or_else(|| CloudError::NotFound {
                operation: "DetachNetworkInterface",
                what: format!("attachment {attachment_id}"),
            })?;
        iface.attachment = None;
        iface.status = InterfaceStatus::Available;
        Ok(())
    }

    async fn delete_interface(&self, interface_id: &str) -> Result<(), CloudError> {
        const OP: &str = "DeleteNetworkInterface";
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::DeleteInterface, interface_id, &[])?;

        match state.interfaces.get(interface_id) {
            None => Err(CloudError::NotFound {
                operation: OP,
                what: format!("interface {interface_id}"),
            }),
            Some(iface) if iface.attachment.is_some() => Err(CloudError::InvalidParameter {
                operation: OP,
                reason: format!("{interface_id} is in use"),
            }),
            Some(_) => {
                state.interfaces.remove(interface_id);
                Ok(())
            }
        }
    }

    async fn assign_addresses(
        &self,
        interface_id: &str,
        addresses: &[Ipv4Addr],
        allow_reassignment: bool,
    ) -> Result<(), CloudError> {
        const OP: &str = "AssignPrivateIpAddresses";
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::AssignAddresses, interface_id, addresses)?;

        let Some(iface) = state.interfaces.get(interface_id) else {
            return Err(CloudError::NotFound {
                operation: OP,
                what: format!("interface {interface_id}"),
            });
        };
        if iface.private_addresses.len() + addresses.len() > state.network_info.ipv4_per_interface {
            return Err(CloudError::InvalidParameter {
                operation: OP,
                reason: format!(
                    "{interface_id} has no room for {} more addresses",
                    addresses.len()
                ),
            });
        }
        for addr in addresses {
            match state.address_owner(*addr) {
                None => {}
                Some((owner, _)) if owner == interface_id => {
                    return Err(CloudError::InvalidParameter {
                        operation: OP,
                        reason: format!("{addr} is already assigned to {interface_id}"),
                    });
                }
                Some((_, true)) => {
                    return Err(CloudError::InvalidParameter {
                        operation: OP,
                        reason: format!("{addr} is another interface's primary address"),
                    });
                }
                Some((owner, false)) if !allow_reassignment => {
                    return Err(CloudError::InvalidParameter {
                        operation: OP,
                        reason: format!("{addr} is assigned to {owner}"),
                    });
                }
                Some(_) => {}
            }
        }

        if state.lost_assigns > 0 {
            state.lost_assigns -= 1;
            debug!(iface_id = %interface_id, "[FAKE] Dropping address assignment");
            return Ok(());
        }

        for other in state.interfaces.values_mut() {
            other
                .private_addresses
                .retain(|a| a.primary || !addresses.contains(&a.address));
        }
        if let Some(iface) = state.interfaces.get_mut(interface_id) {
            iface
                .private_addresses
                .extend(addresses.iter().map(|a| PrivateAddress {
                    address: *a,
                    primary: false,
                }));
        }
        Ok(())
    }

    async fn unassign_addresses(
        &self,
        interface_id: &str,
        addresses: &[Ipv4Addr],
    ) -> Result<(), CloudError> {
        const OP: &str = "UnassignPrivateIpAddresses";
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::UnassignAddresses, interface_id, addresses)?;

        let iface = state
            .interfaces
            .get_mut(interface_id)
            .ok_or_else(|| CloudError::NotFound {
                operation: OP,
                what: format!("interface {interface_id}"),
            })?;
        for addr in addresses {
            match iface.private_addresses.iter().find(|a| a.address == *addr) {
                None => {
                    return Err(CloudError::NotFound {
                        operation: OP,
                        what: format!("address {addr}"),
                    })
                }
                Some(a) if a.primary => {
                    return Err(CloudError::InvalidParameter {
                        operation: OP,
                        reason: format!("{addr} is the primary address"),
                    })
                }
                Some(_) => {}
            }
        }
        iface
            .private_addresses
            .retain(|a| !addresses.contains(&a.address));
        Ok(())
    }

    async fn list_unattached_owned_interfaces(
        &self,
        instance_id: &str,
    ) -> Result<Vec<NetworkInterface>, CloudError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::ListUnattached, instance_id, &[])?;
        Ok(state
            .interfaces
            .values()
            .filter(|i| {
                i.attachment.is_none()
                    && i.status == InterfaceStatus::Available
                    && i.is_owned()
                    && i.owning_instance() == Some(instance_id)
            })
            .cloned()
            .collect())
    }

    async fn set_delete_on_termination(
        &self,
        interface_id: &str,
        attachment_id: &str,
    ) -> Result<(), CloudError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.record(CloudOp::SetDeleteOnTermination, interface_id, &[])?;

        let attachment = state
            .interfaces
            .get_mut(interface_id)
            .and_then(|i| i.attachment.as_mut())
            .filter(|a| a.id == attachment_id)
            .ok_or_else(|| CloudError::NotFound {
                operation: "ModifyNetworkInterfaceAttribute",
                what: format!("attachment {attachment_id} of {interface_id}"),
            })?;
        attachment.delete_on_termination = true;
        Ok(())
    }
}

#[async_trait]
impl CloudClientFactory for FakeCloud {
    async fn connect(&self) -> Result<Arc<dyn CloudInterfaceClient>, CloudError> {
        let mut state = self.state();
        state.connects += 1;
        state.record(CloudOp::Connect, &self.instance_id, &[])?;
        Ok(Arc::new(self.clone()))
    }
}
