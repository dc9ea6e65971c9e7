//! Resync engine.
//!
//! One resync reads the interfaces attached to this instance, compares them
//! with the desired state and makes the cloud calls needed to converge:
//! unwanted addresses and interfaces are released, new interfaces are created
//! in the selected subnet, and missing addresses are assigned to interfaces
//! with free slots.
//!
//! Any phase that changes cloud state in a way that invalidates the snapshot
//! returns [`Phase::Restart`]; the attempt is then rerun from a fresh
//! snapshot within the same attempt budget.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eni_networking::{gateway_for, parse_cidr, MacAddr};
use eni_reconcile::{proceed, BatchOutcome, Phase};
use ipnet::Ipv4Net;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::capability::CapabilityModel;
use crate::cloud::{
    interface_description, owned_interface_tags, CloudClientFactory, CloudInterfaceClient,
    CreateInterfaceRequest, NetworkInterface, Subnet,
};
use crate::config::ProvisionerConfig;
use crate::error::ResyncError;
use crate::health::{HealthReport, HealthSink, HEALTH_ENI_CAPACITY};
use crate::ipam::{secondary_iface_handle, AutoAssignRequest, IpamClient, IpamError};
use crate::snapshot::{CloudStateSnapshot, ResyncWorkingState};
use crate::subnet::calculate_best_subnet;
use crate::subnets_file::SubnetsFile;
use crate::types::{DesiredState, Iface, IfaceState, SecondaryIfaceCapacities};

/// Receives the capacity figures computed on every resync attempt.
pub type CapacityCallback = Arc<dyn Fn(SecondaryIfaceCapacities) + Send + Sync>;

/// A desired address with no cloud counterpart yet.
#[derive(Debug, Clone)]
struct MissingAddress {
    addr: Ipv4Addr,
    subnet_id: String,
}

/// Controller state that survives across resyncs.
///
/// The scan flags are sticky: they are set when a problem is noticed and only
/// cleared once a later resync has handled it.
struct ControllerState {
    desired: DesiredState,
    resync_needed: bool,
    orphan_scan_needed: bool,
    host_ipam_scan_needed: bool,
    recheck_reset_needed: bool,
    capability: Option<CapabilityModel>,
    cloud: Option<Arc<dyn CloudInterfaceClient>>,
    subnet_cidr: Option<Ipv4Net>,
    gateway: Option<Ipv4Addr>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            desired: DesiredState::default(),
            resync_needed: false,
            // Interfaces or addresses may have leaked before a restart.
            orphan_scan_needed: true,
            host_ipam_scan_needed: true,
            recheck_reset_needed: false,
            capability: None,
            cloud: None,
            subnet_cidr: None,
            gateway: None,
        }
    }
}

/// Converges this instance's secondary interfaces toward the desired state.
pub struct ResyncEngine {
    node_name: String,
    call_timeout: Duration,
    max_attempts: u32,
    factory: Arc<dyn CloudClientFactory>,
    ipam: Arc<dyn IpamClient>,
    health: Arc<dyn HealthSink>,
    capacity_callback: CapacityCallback,
    subnets_file: Option<SubnetsFile>,
    state: ControllerState,
}

impl ResyncEngine {
    pub fn new(
        config: &ProvisionerConfig,
        factory: Arc<dyn CloudClientFactory>,
        ipam: Arc<dyn IpamClient>,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        Self {
            node_name: config.node_name.clone(),
            call_timeout: config.call_timeout,
            max_attempts: config.max_attempts,
            factory,
            ipam,
            health,
            capacity_callback: Arc::new(|_| {}),
            subnets_file: config.subnets_file.clone().map(SubnetsFile::new),
            state: ControllerState::default(),
        }
    }

    pub fn with_capacity_callback(mut self, callback: CapacityCallback) -> Self {
        self.capacity_callback = callback;
        self
    }

    pub fn with_subnets_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.subnets_file = Some(SubnetsFile::new(path));
        self
    }

    /// Replace the desired state and mark a resync as needed.
    pub fn set_desired(&mut self, desired: DesiredState) {
        self.state.desired = desired;
        self.state.resync_needed = true;
    }

    pub fn desired(&self) -> &DesiredState {
        &self.state.desired
    }

    pub fn resync_needed(&self) -> bool {
        self.state.resync_needed
    }

    pub fn mark_resync_needed(&mut self) {
        self.state.resync_needed = true;
    }

    pub fn orphan_scan_needed(&self) -> bool {
        self.state.orphan_scan_needed
    }

    pub fn host_ipam_scan_needed(&self) -> bool {
        self.state.host_ipam_scan_needed
    }

    pub fn has_cloud_client(&self) -> bool {
        self.state.cloud.is_some()
    }

    /// Returns true, once, if cloud state was changed since the last call.
    pub fn take_recheck_reset(&mut self) -> bool {
        std::mem::take(&mut self.state.recheck_reset_needed)
    }

    /// Run resync attempts until one completes or the budget runs out.
    ///
    /// Shutdown is checked before every attempt; an in-flight cloud call is
    /// never interrupted.
    pub async fn resync(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<IfaceState, ResyncError> {
        for attempt in 1..=self.max_attempts {
            if *shutdown.borrow() {
                return Err(ResyncError::Cancelled);
            }
            match self.attempt_resync().await {
                Ok(Phase::Proceed(state)) => {
                    self.state.resync_needed = false;
                    return Ok(state);
                }
                Ok(Phase::Restart) => {
                    debug!(attempt, "Cloud state changed during resync, restarting");
                }
                Err(e) => {
                    // The client itself may be broken; reconnect next time.
                    self.state.cloud = None;
                    return Err(e);
                }
            }
        }
        self.state.cloud = None;
        Err(ResyncError::AttemptsExhausted {
            attempts: self.max_attempts,
        })
    }

    /// One pass over the resync phases.
    pub async fn attempt_resync(&mut self) -> Result<Phase<IfaceState>, ResyncError> {
        let cloud = self.cloud().await?;
        let caps = self.ensure_capability(cloud.as_ref()).await?;

        let (mut snapshot, mut working) = self.load_snapshot(cloud.as_ref(), &caps).await?;
        self.ensure_delete_on_termination(cloud.as_ref(), &snapshot)
            .await?;

        (self.capacity_callback)(SecondaryIfaceCapacities {
            max_calico_secondary_ips: caps.max_secondary_addresses(snapshot.non_owned_by_id.len()),
        });

        let stale = self.find_stale_addresses(&snapshot);

        let local_subnets = self.load_local_subnets(cloud.as_ref()).await?;
        self.update_subnets_file(&local_subnets).await?;

        let without_pool = self.find_ifaces_without_pool(&snapshot);
        let missing = self.find_missing_addresses(&snapshot, &local_subnets);

        proceed!(self.unassign_addresses(cloud.as_ref(), stale).await?);
        proceed!(
            self.release_interfaces(cloud.as_ref(), &snapshot, without_pool)
                .await?
        );

        let Some(subnet) = calculate_best_subnet(&self.state.desired, &snapshot, &local_subnets)
        else {
            debug!("No secondary subnet needed");
            self.health
                .report(HEALTH_ENI_CAPACITY, HealthReport::ready(true));
            return Ok(Phase::Proceed(IfaceState::default()));
        };
        let subnet_id = subnet.id.clone();
        self.update_subnet_cidr(subnet)?;

        let missing = filter_to_subnet(missing, &subnet_id);
        if missing.is_empty() {
            self.health
                .report(HEALTH_ENI_CAPACITY, HealthReport::ready(true));
            return self.calculate_result(&snapshot).map(Phase::Proceed);
        }

        if self.state.orphan_scan_needed {
            proceed!(
                self.attach_orphans(cloud.as_ref(), &caps, &mut working, &subnet_id)
                    .await?
            );
        }
        if self.state.host_ipam_scan_needed {
            self.free_unused_host_addresses(&snapshot).await?;
        }

        let needed = self.interfaces_needed(&caps, &snapshot, &subnet_id)?;
        let to_create = self.clamp_to_capacity(needed, &caps, &working);

        let mut changed = false;
        if to_create > 0 {
            let addrs = self.allocate_primary_addresses(to_create, &subnet_id).await?;
            self.create_interfaces(
                cloud.as_ref(),
                &caps,
                &snapshot,
                &mut working,
                &subnet_id,
                &addrs,
            )
            .await?;
            changed = true;
        }
        changed |= self
            .assign_addresses(cloud.as_ref(), &mut working, &subnet_id, &missing)
            .await?;

        if changed {
            (snapshot, _) = self.load_snapshot(cloud.as_ref(), &caps).await?;
        }
        self.calculate_result(&snapshot).map(Phase::Proceed)
    }

    // =========================================================================
    // Collaborator plumbing
    // =========================================================================

    /// Bound a collaborator call by the per-call timeout.
    async fn call<T, E>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, ResyncError>
    where
        ResyncError: From<E>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ResyncError::Timeout {
                operation,
                after: self.call_timeout,
            }),
        }
    }

    async fn cloud(&mut self) -> Result<Arc<dyn CloudInterfaceClient>, ResyncError> {
        if let Some(cloud) = &self.state.cloud {
            return Ok(cloud.clone());
        }
        let cloud = self.call("Connect", self.factory.connect()).await?;
        self.state.cloud = Some(cloud.clone());
        Ok(cloud)
    }

    fn reset_recheck(&mut self, operation: &'static str) {
        debug!(operation, "Changing cloud state, queueing a recheck");
        self.state.recheck_reset_needed = true;
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn ensure_capability(
        &mut self,
        cloud: &dyn CloudInterfaceClient,
    ) -> Result<CapabilityModel, ResyncError> {
        if let Some(caps) = &self.state.capability {
            return Ok(caps.clone());
        }
        let fetched = async {
            let instance_type = self
                .call("DescribeInstances", cloud.my_instance_type())
                .await?;
            let info = self
                .call(
                    "DescribeInstanceTypes",
                    cloud.instance_network_capability(&instance_type),
                )
                .await?;
            Ok::<_, ResyncError>((instance_type, info))
        }
        .await;
        let (instance_type, info) = fetched.inspect_err(|e| {
            error!(
                error = %e,
                "Failed to get this instance's network capabilities; check cloud API permissions"
            )
        })?;

        let caps = CapabilityModel::new(&info);
        info!(
            instance_type = %instance_type,
            max_interfaces = caps.max_interfaces,
            max_ipv4_per_interface = caps.max_ipv4_per_interface,
            "Retrieved instance network capabilities"
        );
        self.state.capability = Some(caps.clone());
        Ok(caps)
    }

    async fn load_snapshot(
        &self,
        cloud: &dyn CloudInterfaceClient,
        caps: &CapabilityModel,
    ) -> Result<(CloudStateSnapshot, ResyncWorkingState), ResyncError> {
        let interfaces = self
            .call("DescribeNetworkInterfaces", cloud.list_my_network_interfaces())
            .await?;
        Ok(CloudStateSnapshot::build(interfaces, caps))
    }

    async fn ensure_delete_on_termination(
        &mut self,
        cloud: &dyn CloudInterfaceClient,
        snapshot: &CloudStateSnapshot,
    ) -> Result<(), ResyncError> {
        let mut batch = BatchOutcome::new("set delete-on-termination");
        for iface in snapshot.owned_by_id.values() {
            let Some(attachment) = &iface.attachment else {
                continue;
            };
            if attachment.delete_on_termination {
                continue;
            }
            self.reset_recheck("set-delete-on-termination");
            info!(iface_id = %iface.id, "Secondary interface not deleted on termination, fixing");
            let result = self
                .call(
                    "ModifyNetworkInterfaceAttribute",
                    cloud.set_delete_on_termination(&iface.id, &attachment.id),
                )
                .await;
            if let Err(e) = &result {
                error!(iface_id = %iface.id, error = %e, "Failed to set delete-on-termination");
            }
            batch.record(iface.id.clone(), result);
        }
        batch.into_result()?;
        Ok(())
    }

    /// Secondary addresses no longer wanted, grouped by interface.
    fn find_stale_addresses(
        &self,
        snapshot: &CloudStateSnapshot,
    ) -> BTreeMap<String, Vec<Ipv4Addr>> {
        let mut stale: BTreeMap<String, Vec<Ipv4Addr>> = BTreeMap::new();
        for (addr, iface_id) in &snapshot.iface_id_by_secondary_addr {
            if !self.state.desired.wants_address(*addr) {
                stale.entry(iface_id.clone()).or_default().push(*addr);
            }
        }
        for (iface_id, addrs) in &stale {
            info!(iface_id = %iface_id, addrs = ?addrs, "Found unwanted secondary addresses");
        }
        stale
    }

    async fn load_local_subnets(
        &self,
        cloud: &dyn CloudInterfaceClient,
    ) -> Result<BTreeMap<String, Subnet>, ResyncError> {
        let subnets = self
            .call("DescribeSubnets", cloud.list_az_local_subnets())
            .await?;
        Ok(subnets.into_iter().map(|s| (s.id.clone(), s)).collect())
    }

    async fn update_subnets_file(
        &self,
        local_subnets: &BTreeMap<String, Subnet>,
    ) -> Result<(), ResyncError> {
        let Some(file) = &self.subnets_file else {
            return Ok(());
        };
        file.update(local_subnets.keys().map(String::as_str))
            .await
            .map_err(|source| ResyncError::SubnetsFile {
                path: file.path().to_path_buf(),
                source,
            })?;
        Ok(())
    }

    /// Owned interfaces in subnets that no IP pool backs any more.
    fn find_ifaces_without_pool(&self, snapshot: &CloudStateSnapshot) -> Vec<String> {
        snapshot
            .owned_by_id
            .values()
            .filter(|iface| {
                !self
                    .state
                    .desired
                    .pool_ids_by_subnet
                    .contains_key(&iface.subnet_id)
            })
            .map(|iface| {
                info!(
                    iface_id = %iface.id,
                    subnet = %iface.subnet_id,
                    "Secondary interface belongs to a subnet with no IP pool, releasing"
                );
                iface.id.clone()
            })
            .collect()
    }

    fn find_missing_addresses(
        &self,
        snapshot: &CloudStateSnapshot,
        local_subnets: &BTreeMap<String, Subnet>,
    ) -> Vec<MissingAddress> {
        let mut missing = Vec::new();
        for (dest, route) in &self.state.desired.routes_by_destination {
            let addr = dest.addr();
            if !local_subnets.contains_key(&route.subnet_id) {
                warn!(
                    addr = %addr,
                    subnet = %route.subnet_id,
                    "Workload needs an address from a subnet outside this availability zone"
                );
                continue;
            }
            if let Some(iface_id) = snapshot.iface_id_by_primary_addr.get(&addr) {
                warn!(
                    addr = %addr,
                    iface_id = %iface_id,
                    "Workload address clashes with the primary address of a secondary interface"
                );
                continue;
            }
            if snapshot.foreign_addresses.contains(&addr) {
                warn!(
                    addr = %addr,
                    "Workload address clashes with an address of a non-secondary interface"
                );
                continue;
            }
            if snapshot.iface_id_by_secondary_addr.contains_key(&addr) {
                continue;
            }
            missing.push(MissingAddress {
                addr,
                subnet_id: route.subnet_id.clone(),
            });
        }
        if !missing.is_empty() {
            info!(
                count = missing.len(),
                "Found workload addresses missing from secondary interfaces"
            );
        }
        missing
    }

    async fn unassign_addresses(
        &mut self,
        cloud: &dyn CloudInterfaceClient,
        stale: BTreeMap<String, Vec<Ipv4Addr>>,
    ) -> Result<Phase<()>, ResyncError> {
        if stale.is_empty() {
            return Ok(Phase::Proceed(()));
        }
        self.reset_recheck("unassign-addresses");

        let mut batch = BatchOutcome::new("unassign addresses");
        for (iface_id, addrs) in stale {
            let result = self
                .call(
                    "UnassignPrivateIpAddresses",
                    cloud.unassign_addresses(&iface_id, &addrs),
                )
                .await;
            match &result {
                Ok(()) => {
                    info!(iface_id = %iface_id, addrs = ?addrs, "Unassigned secondary addresses")
                }
                Err(e) => error!(
                    iface_id = %iface_id,
                    error = %e,
                    "Failed to unassign secondary addresses"
                ),
            }
            batch.record(iface_id, result);
        }

        // Failed interfaces are retried from the fresh snapshot.
        if !batch.any_succeeded() {
            batch.into_result()?;
        }
        debug!("Unassigned addresses, restarting resync");
        Ok(Phase::Restart)
    }

    async fn release_interfaces(
        &mut self,
        cloud: &dyn CloudInterfaceClient,
        snapshot: &CloudStateSnapshot,
        iface_ids: Vec<String>,
    ) -> Result<Phase<()>, ResyncError> {
        if iface_ids.is_empty() {
            return Ok(Phase::Proceed(()));
        }
        self.state.host_ipam_scan_needed = true;
        self.reset_recheck("release-interface");

        let mut batch = BatchOutcome::new("release interfaces");
        for iface_id in iface_ids {
            if let Some(attachment_id) = snapshot.attachment_id_by_iface_id.get(&iface_id) {
                // Delete is still worth trying; detach fails on an already
                // detached interface.
                if let Err(e) = self
                    .call("DetachNetworkInterface", cloud.detach_interface(attachment_id, true))
                    .await
                {
                    warn!(iface_id = %iface_id, error = %e, "Failed to detach secondary interface");
                }
            }
            let result = self
                .call("DeleteNetworkInterface", cloud.delete_interface(&iface_id))
                .await;
            match &result {
                Ok(()) => info!(iface_id = %iface_id, "Released secondary interface"),
                Err(e) => {
                    error!(
                        iface_id = %iface_id,
                        error = %e,
                        "Failed to delete secondary interface"
                    );
                    self.state.orphan_scan_needed = true;
                }
            }
            batch.record(iface_id, result);
        }
        batch.into_result()?;
        debug!("Released interfaces, restarting resync");
        Ok(Phase::Restart)
    }

    fn update_subnet_cidr(&mut self, subnet: &Subnet) -> Result<(), ResyncError> {
        let block = subnet
            .cidr_block
            .as_deref()
            .ok_or_else(|| ResyncError::SubnetMissingCidr {
                subnet_id: subnet.id.clone(),
            })?;
        let cidr = parse_cidr(block)?;
        let gateway = gateway_for(cidr);
        if self.state.subnet_cidr != Some(cidr) || self.state.gateway != Some(gateway) {
            info!(subnet = %cidr, gateway = %gateway, "Calculated new subnet CIDR and gateway");
            self.state.subnet_cidr = Some(cidr);
            self.state.gateway = Some(gateway);
        }
        Ok(())
    }

    async fn attach_orphans(
        &mut self,
        cloud: &dyn CloudInterfaceClient,
        caps: &CapabilityModel,
        working: &mut ResyncWorkingState,
        subnet_id: &str,
    ) -> Result<Phase<()>, ResyncError> {
        let orphans = self
            .call(
                "DescribeNetworkInterfaces",
                cloud.list_unattached_owned_interfaces(cloud.instance_id()),
            )
            .await?;

        let mut attached = 0usize;
        let mut leaks = BatchOutcome::new("clean up unattached interfaces");
        for orphan in orphans {
            self.reset_recheck("attach-orphan-interface");
            let in_subnet = orphan.subnet_id == subnet_id;
            if in_subnet && working.has_free_device_index(caps) {
                let idx = working.find_free_device_index();
                match self
                    .call("AttachNetworkInterface", cloud.attach_interface(&orphan.id, idx, 0))
                    .await
                {
                    Ok(attachment_id) => {
                        working.claim_device_index(idx);
                        attached += 1;
                        info!(
                            iface_id = %orphan.id,
                            device_index = idx,
                            attachment_id = %attachment_id,
                            "Attached orphaned secondary interface"
                        );
                        continue;
                    }
                    Err(e) => {
                        error!(
                            iface_id = %orphan.id,
                            error = %e,
                            "Failed to attach orphaned interface, deleting it"
                        );
                    }
                }
            } else if !in_subnet {
                info!(
                    iface_id = %orphan.id,
                    iface_subnet = %orphan.subnet_id,
                    active_subnet = %subnet_id,
                    "Found unattached interface outside the active subnet, deleting"
                );
            } else {
                info!(
                    iface_id = %orphan.id,
                    "No capacity to attach unattached interface, deleting"
                );
            }

            let result = self
                .call("DeleteNetworkInterface", cloud.delete_interface(&orphan.id))
                .await;
            if let Err(e) = &result {
                error!(iface_id = %orphan.id, error = %e, "Failed to delete unattached interface");
            }
            leaks.record(orphan.id, result);
        }

        let leaked = leaks.failures().len();
        if leaked == 0 {
            self.state.orphan_scan_needed = false;
        } else if leaked > caps.max_interfaces {
            // Back off rather than leak further.
            leaks.into_result()?;
        }
        if attached > 0 {
            debug!(attached, "Attached orphaned interfaces, restarting resync");
            return Ok(Phase::Restart);
        }
        Ok(Phase::Proceed(()))
    }

    async fn free_unused_host_addresses(
        &mut self,
        snapshot: &CloudStateSnapshot,
    ) -> Result<(), ResyncError> {
        let handle = secondary_iface_handle(&self.node_name);
        let ours = self
            .call("IPAMAddressesByHandle", self.ipam.addresses_by_handle(&handle))
            .await?;
        let unused: Vec<Ipv4Addr> = ours
            .into_iter()
            .filter(|addr| !snapshot.iface_id_by_primary_addr.contains_key(addr))
            .collect();

        if !unused.is_empty() {
            info!(addrs = ?unused, "Releasing host addresses not used by any secondary interface");
            let unallocated = self
                .call("IPAMReleaseAddresses", self.ipam.release_addresses(&unused))
                .await?;
            if !unallocated.is_empty() {
                debug!(addrs = ?unallocated, "Some host addresses were already released");
            }
        }
        self.state.host_ipam_scan_needed = false;
        Ok(())
    }

    fn interfaces_needed(
        &self,
        caps: &CapabilityModel,
        snapshot: &CloudStateSnapshot,
        subnet_id: &str,
    ) -> Result<usize, ResyncError> {
        let per_iface = caps.secondary_addresses_per_interface();
        if per_iface == 0 {
            error!("Instance type doesn't support secondary addresses");
            return Err(ResyncError::NoSecondaryAddressSupport {
                max_ipv4_per_interface: caps.max_ipv4_per_interface,
            });
        }
        let total = self.state.desired.destinations_in_subnet(subnet_id);
        Ok(total
            .div_ceil(per_iface)
            .saturating_sub(snapshot.owned_in_subnet(subnet_id)))
    }

    fn clamp_to_capacity(
        &self,
        needed: usize,
        caps: &CapabilityModel,
        working: &ResyncWorkingState,
    ) -> usize {
        let possible = working.unused_interface_capacity(caps);
        let enough = needed <= possible;
        self.health
            .report(HEALTH_ENI_CAPACITY, HealthReport::ready(enough));
        if enough {
            return needed;
        }
        warn!(
            needed,
            possible,
            "Need more secondary interfaces than this instance can attach"
        );
        possible
    }

    async fn allocate_primary_addresses(
        &mut self,
        count: usize,
        subnet_id: &str,
    ) -> Result<Vec<Ipv4Addr>, ResyncError> {
        let request = AutoAssignRequest::secondary_ifaces(&self.node_name, count, subnet_id);
        let result = self
            .call("IPAMAutoAssign", self.ipam.auto_assign(request))
            .await
            .and_then(|addrs| {
                if addrs.is_empty() {
                    Err(IpamError::NoAddressesAvailable { requested: count }.into())
                } else {
                    Ok(addrs)
                }
            });
        let addrs = match result {
            Ok(addrs) => addrs,
            Err(e) => {
                // Addresses may have been allocated before the failure.
                self.state.host_ipam_scan_needed = true;
                return Err(e);
            }
        };

        if addrs.len() < count {
            warn!(
                needed = count,
                allocated = addrs.len(),
                "Couldn't allocate enough primary addresses; IP pool may be full"
            );
        }
        info!(addrs = ?addrs, "Allocated primary addresses for new secondary interfaces");
        Ok(addrs)
    }

    async fn create_interfaces(
        &mut self,
        cloud: &dyn CloudInterfaceClient,
        caps: &CapabilityModel,
        snapshot: &CloudStateSnapshot,
        working: &mut ResyncWorkingState,
        subnet_id: &str,
        addrs: &[Ipv4Addr],
    ) -> Result<(), ResyncError> {
        self.reset_recheck("create-interface");
        let security_groups = snapshot.primary_security_groups();

        let mut batch = BatchOutcome::new("create interfaces");
        for addr in addrs {
            let request = CreateInterfaceRequest {
                subnet_id: subnet_id.to_string(),
                description: interface_description(cloud.instance_id()),
                security_groups: security_groups.clone(),
                primary_address: *addr,
                tags: owned_interface_tags(cloud.instance_id()),
            };
            let iface = match self
                .call("CreateNetworkInterface", cloud.create_interface(request))
                .await
            {
                Ok(iface) => iface,
                Err(e) => {
                    error!(addr = %addr, error = %e, "Failed to create secondary interface");
                    batch.record_err(*addr, e);
                    continue;
                }
            };

            let idx = working.find_free_device_index();
            working.claim_device_index(idx);
            let attachment_id = match self
                .call("AttachNetworkInterface", cloud.attach_interface(&iface.id, idx, 0))
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    error!(
                        iface_id = %iface.id,
                        error = %e,
                        "Failed to attach secondary interface"
                    );
                    batch.record_err(*addr, e);
                    continue;
                }
            };
            info!(
                iface_id = %iface.id,
                device_index = idx,
                attachment_id = %attachment_id,
                "Attached new secondary interface"
            );
            working.set_free_slots(
                &iface.id,
                subnet_id,
                caps.max_ipv4_per_interface
                    .saturating_sub(iface.private_addresses.len()),
            );

            let result = self
                .call(
                    "ModifyNetworkInterfaceAttribute",
                    cloud.set_delete_on_termination(&iface.id, &attachment_id),
                )
                .await;
            if let Err(e) = &result {
                error!(iface_id = %iface.id, error = %e, "Failed to set delete-on-termination");
            }
            batch.record(*addr, result);
        }

        if !batch.is_clean() {
            info!("Interface operations failed; queueing orphan and host address scans");
            self.state.host_ipam_scan_needed = true;
            self.state.orphan_scan_needed = true;
        }
        batch.into_result()?;
        Ok(())
    }

    /// Assign missing addresses to interfaces with free slots.
    ///
    /// Returns true if anything was assigned.
    async fn assign_addresses(
        &mut self,
        cloud: &dyn CloudInterfaceClient,
        working: &mut ResyncWorkingState,
        subnet_id: &str,
        missing: &[Ipv4Addr],
    ) -> Result<bool, ResyncError> {
        if missing.is_empty() {
            return Ok(false);
        }
        self.reset_recheck("assign-addresses");

        let mut remaining = missing;
        let mut batch = BatchOutcome::new("assign addresses");
        for (iface_id, free) in working.ifaces_with_room(subnet_id) {
            if remaining.is_empty() {
                break;
            }
            let (chunk, rest) = remaining.split_at(free.min(remaining.len()));
            remaining = rest;

            let result = self
                .call(
                    "AssignPrivateIpAddresses",
                    cloud.assign_addresses(&iface_id, chunk, true),
                )
                .await;
            match &result {
                Ok(()) => {
                    working.consume_slots(&iface_id, chunk.len());
                    info!(
                        iface_id = %iface_id,
                        addrs = ?chunk,
                        "Assigned addresses to secondary interface"
                    );
                }
                Err(e) => {
                    error!(
                        iface_id = %iface_id,
                        addrs = ?chunk,
                        error = %e,
                        "Failed to assign addresses"
                    );
                }
            }
            batch.record(iface_id, result);
        }

        if !remaining.is_empty() {
            warn!(
                unassigned = ?remaining,
                "Insufficient secondary address capacity on the available interfaces"
            );
        }
        let any_assigned = batch.any_succeeded();
        batch.into_result()?;
        Ok(any_assigned)
    }

    fn calculate_result(&self, snapshot: &CloudStateSnapshot) -> Result<IfaceState, ResyncError> {
        let mut secondary_ifaces_by_mac = BTreeMap::new();
        for iface in snapshot.owned_by_id.values() {
            match to_iface(iface) {
                Ok(converted) => {
                    secondary_ifaces_by_mac.insert(converted.mac, converted);
                }
                Err(e) => warn!(
                    iface_id = %iface.id,
                    error = %e,
                    "Failed to convert secondary interface"
                ),
            }
        }

        let primary = snapshot
            .primary
            .as_ref()
            .ok_or(ResyncError::NoPrimaryInterface)?;
        let primary = to_iface(primary)
            .inspect_err(|e| error!(error = %e, "Failed to convert primary interface"))?;

        Ok(IfaceState {
            primary_mac: Some(primary.mac),
            secondary_ifaces_by_mac,
            subnet_cidr: self.state.subnet_cidr,
            gateway: self.state.gateway,
        })
    }
}

fn filter_to_subnet(missing: Vec<MissingAddress>, subnet_id: &str) -> Vec<Ipv4Addr> {
    missing
        .into_iter()
        .filter_map(|m| {
            if m.subnet_id == subnet_id {
                return Some(m.addr);
            }
            warn!(
                addr = %m.addr,
                subnet = %m.subnet_id,
                active_subnet = %subnet_id,
                "Only one subnet is supported per node; address can't be added"
            );
            None
        })
        .collect()
}

fn to_iface(iface: &NetworkInterface) -> Result<Iface, ResyncError> {
    let mac: MacAddr = iface
        .mac_address
        .as_deref()
        .ok_or_else(|| ResyncError::MissingMac {
            iface_id: iface.id.clone(),
        })?
        .parse()?;
    Ok(Iface {
        id: iface.id.clone(),
        mac,
        primary_address: iface.primary_address(),
        secondary_addresses: iface.secondary_addresses(),
    })
}
