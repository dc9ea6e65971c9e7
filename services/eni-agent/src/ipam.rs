//! IP address management interface.
//!
//! Primary addresses of secondary interfaces are allocated from IPAM pools
//! reserved for host use, under a handle derived from the node name so that
//! leaked allocations can be found and released later.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use eni_networking::Ipv4Pool;
use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::{debug, warn};

/// Attribute key recording what an allocation is for.
pub const ATTR_TYPE: &str = "type";

/// Attribute key recording the node an allocation belongs to.
pub const ATTR_NODE: &str = "node";

/// [`ATTR_TYPE`] value for secondary interface primaries.
pub const TYPE_SECONDARY_IFACE: &str = "aws-secondary-iface";

/// The IPAM handle owning this node's secondary interface primaries.
pub fn secondary_iface_handle(node_name: &str) -> String {
    format!("aws-secondary-ifaces-{node_name}")
}

/// What an IP pool may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntendedUse {
    Workload,
    Tunnel,
    HostSecondary,
}

/// An auto-assignment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoAssignRequest {
    pub num4: usize,
    pub handle: String,
    pub attributes: BTreeMap<String, String>,
    pub hostname: String,
    pub intended_use: IntendedUse,
    /// Restrict allocation to pools backing these cloud subnets.
    pub subnet_ids: Vec<String>,
}

impl AutoAssignRequest {
    /// Request `num4` secondary interface primaries for `node_name` in
    /// `subnet_id`.
    pub fn secondary_ifaces(node_name: &str, num4: usize, subnet_id: &str) -> Self {
        Self {
            num4,
            handle: secondary_iface_handle(node_name),
            attributes: BTreeMap::from([
                (ATTR_TYPE.to_string(), TYPE_SECONDARY_IFACE.to_string()),
                (ATTR_NODE.to_string(), node_name.to_string()),
            ]),
            hostname: node_name.to_string(),
            intended_use: IntendedUse::HostSecondary,
            subnet_ids: vec![subnet_id.to_string()],
        }
    }
}

/// IPAM errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IpamError {
    /// The backing datastore failed.
    #[error("IPAM datastore error: {0}")]
    Datastore(String),

    /// No address could be allocated at all.
    #[error("no IPv4 addresses available ({requested} requested)")]
    NoAddressesAvailable { requested: usize },
}

/// Address management operations.
#[async_trait]
pub trait IpamClient: Send + Sync {
    /// Allocate up to `request.num4` addresses. May return fewer.
    async fn auto_assign(&self, request: AutoAssignRequest) -> Result<Vec<Ipv4Addr>, IpamError>;

    /// Release addresses. Returns the ones that were not allocated.
    async fn release_addresses(&self, addresses: &[Ipv4Addr]) -> Result<Vec<Ipv4Addr>, IpamError>;

    /// Addresses allocated under `handle`; empty for an unknown handle.
    async fn addresses_by_handle(&self, handle: &str) -> Result<Vec<Ipv4Addr>, IpamError>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// An IPAM operation, for call accounting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpamOp {
    AutoAssign,
    Release,
    ByHandle,
}

#[derive(Debug)]
struct IpPool {
    pool: Ipv4Pool,
    intended_use: IntendedUse,
    subnet_id: Option<String>,
}

#[derive(Debug, Default)]
struct IpamState {
    pools: Vec<IpPool>,
    by_handle: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    requests: Vec<AutoAssignRequest>,
    calls: Vec<IpamOp>,
    injected: Vec<(IpamOp, IpamError)>,
}

impl IpamState {
    fn record(&mut self, op: IpamOp) -> Result<(), IpamError> {
        self.calls.push(op);
        match self.injected.iter().position(|(o, _)| *o == op) {
            Some(pos) => Err(self.injected.remove(pos).1),
            None => Ok(()),
        }
    }
}

/// In-memory IPAM backed by [`Ipv4Pool`]s.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIpam {
    state: Arc<Mutex<IpamState>>,
}

impl InMemoryIpam {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, IpamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a pool, optionally bound to a cloud subnet.
    pub fn add_pool(&self, cidr: Ipv4Net, intended_use: IntendedUse, subnet_id: Option<&str>) {
        self.state().pools.push(IpPool {
            pool: Ipv4Pool::new(cidr),
            intended_use,
            subnet_id: subnet_id.map(str::to_string),
        });
    }

    /// Record `addr` as allocated under `handle` without a request.
    pub fn seed_allocation(&self, handle: &str, addr: Ipv4Addr) {
        let mut state = self.state();
        for p in state.pools.iter_mut() {
            if p.pool.cidr().contains(&addr) {
                // Reserved addresses are tracked by handle only.
                let _ = p.pool.allocate_specific(addr);
                break;
            }
        }
        state
            .by_handle
            .entry(handle.to_string())
            .or_default()
            .insert(addr);
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: IpamOp, err: IpamError) {
        self.state().injected.push((op, err));
    }

    /// Addresses currently allocated under `handle`.
    pub fn allocated(&self, handle: &str) -> BTreeSet<Ipv4Addr> {
        self.state()
            .by_handle
            .get(handle)
            .cloned()
            .unwrap_or_default()
    }

    /// Auto-assign requests received so far.
    pub fn requests(&self) -> Vec<AutoAssignRequest> {
        self.state().requests.clone()
    }

    pub fn call_count(&self, op: IpamOp) -> usize {
        self.state().calls.iter().filter(|c| **c == op).count()
    }
}

#[async_trait]
impl IpamClient for InMemoryIpam {
    async fn auto_assign(&self, request: AutoAssignRequest) -> Result<Vec<Ipv4Addr>, IpamError> {
        let mut state = self.state();
        state.record(IpamOp::AutoAssign)?;
        state.requests.push(request.clone());

        let mut assigned = Vec::with_capacity(request.num4);
        for p in state.pools.iter_mut() {
            if p.intended_use != request.intended_use {
                continue;
            }
            let subnet_matches = request.subnet_ids.is_empty()
                || p
                    .subnet_id
                    .as_ref()
                    .is_some_and(|s| request.subnet_ids.contains(s));
            if !subnet_matches {
                continue;
            }
            while assigned.len() < request.num4 {
                match p.pool.allocate() {
                    Ok(addr) => assigned.push(addr),
                    Err(_) => break,
                }
            }
        }

        if assigned.len() < request.num4 {
            warn!(
                requested = request.num4,
                allocated = assigned.len(),
                "[IPAM] Pools exhausted"
            );
        }
        state
            .by_handle
            .entry(request.handle)
            .or_default()
            .extend(assigned.iter().copied());
        Ok(assigned)
    }

    async fn release_addresses(&self, addresses: &[Ipv4Addr]) -> Result<Vec<Ipv4Addr>, IpamError> {
        let mut state = self.state();
        state.record(IpamOp::Release)?;

        let mut unallocated = Vec::new();
        for addr in addresses {
            let held = state
                .by_handle
                .values_mut()
                .any(|addrs| addrs.remove(addr));
            if !held {
                unallocated.push(*addr);
                continue;
            }
            for p in state.pools.iter_mut() {
                if p.pool.release(*addr) {
                    break;
                }
            }
            debug!(addr = %addr, "[IPAM] Released address");
        }
        state.by_handle.retain(|_, addrs| !addrs.is_empty());
        Ok(unallocated)
    }

    async fn addresses_by_handle(&self, handle: &str) -> Result<Vec<Ipv4Addr>, IpamError> {
        let mut state = self.state();
        state.record(IpamOp::ByHandle)?;
        Ok(state
            .by_handle
            .get(handle)
            .map(|addrs| addrs.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipam() -> InMemoryIpam {
        let ipam = InMemoryIpam::new();
        ipam.add_pool("10.0.0.0/29".parse().unwrap(), IntendedUse::HostSecondary, Some("subnet-a"));
        ipam.add_pool("10.0.1.0/29".parse().unwrap(), IntendedUse::HostSecondary, Some("subnet-b"));
        ipam.add_pool("192.168.0.0/24".parse().unwrap(), IntendedUse::Workload, None);
        ipam
    }

    #[test]
    fn test_request_carries_handle_and_attributes() {
        let req = AutoAssignRequest::secondary_ifaces("node-1", 2, "subnet-a");
        assert_eq!(req.handle, "aws-secondary-ifaces-node-1");
        assert_eq!(req.attributes[ATTR_TYPE], TYPE_SECONDARY_IFACE);
        assert_eq!(req.attributes[ATTR_NODE], "node-1");
        assert_eq!(req.intended_use, IntendedUse::HostSecondary);
    }

    #[tokio::test]
    async fn test_auto_assign_uses_matching_subnet_pool() {
        let ipam = ipam();
        let addrs = ipam
            .auto_assign(AutoAssignRequest::secondary_ifaces("n", 2, "subnet-b"))
            .await
            .unwrap();
        assert_eq!(addrs, vec![Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(10, 0, 1, 3)]);
        assert_eq!(ipam.allocated("aws-secondary-ifaces-n").len(), 2);
    }

    #[tokio::test]
    async fn test_auto_assign_partial_when_exhausted() {
        let ipam = ipam();
        // A /29 has five allocatable hosts once the gateway is excluded.
        let addrs = ipam
            .auto_assign(AutoAssignRequest::secondary_ifaces("n", 8, "subnet-a"))
            .await
            .unwrap();
        assert_eq!(addrs.len(), 5);
    }

    #[tokio::test]
    async fn test_release_reports_unallocated() {
        let ipam = ipam();
        let addrs = ipam
            .auto_assign(AutoAssignRequest::secondary_ifaces("n", 1, "subnet-a"))
            .await
            .unwrap();
        let stray = Ipv4Addr::new(10, 9, 9, 9);
        let unallocated = ipam.release_addresses(&[addrs[0], stray]).await.unwrap();
        assert_eq!(unallocated, vec![stray]);
        assert!(ipam.addresses_by_handle("aws-secondary-ifaces-n").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_handle_is_empty() {
        let ipam = ipam();
        assert!(ipam.addresses_by_handle("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let ipam = ipam();
        ipam.fail_next(IpamOp::AutoAssign, IpamError::Datastore("down".to_string()));
        let req = AutoAssignRequest::secondary_ifaces("n", 1, "subnet-a");
        assert!(ipam.auto_assign(req.clone()).await.is_err());
        assert_eq!(ipam.auto_assign(req).await.unwrap().len(), 1);
        assert_eq!(ipam.call_count(IpamOp::AutoAssign), 2);
    }
}
