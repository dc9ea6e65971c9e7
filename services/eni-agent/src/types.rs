//! Desired and reported state exchanged with the provisioner's caller.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use eni_networking::{host_net, MacAddr};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// A workload route that must be reachable through a secondary interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    /// Cloud subnet the destination address belongs to.
    pub subnet_id: String,
}

/// Snapshot of what the datastore wants on this node.
///
/// Each update fully replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredState {
    pub routes_by_destination: BTreeMap<Ipv4Net, RouteRecord>,
    /// Destinations needed per subnet; used for sizing.
    pub route_destinations_by_subnet: BTreeMap<String, BTreeSet<Ipv4Net>>,
    /// IP pools backing each subnet. A subnet listed here is wanted.
    pub pool_ids_by_subnet: BTreeMap<String, BTreeSet<String>>,
}

impl DesiredState {
    /// Add a route, keeping the per-subnet index in step.
    pub fn add_route(&mut self, destination: Ipv4Net, subnet_id: &str) {
        if let Some(old) = self.routes_by_destination.insert(
            destination,
            RouteRecord {
                subnet_id: subnet_id.to_string(),
            },
        ) {
            if let Some(dests) = self.route_destinations_by_subnet.get_mut(&old.subnet_id) {
                dests.remove(&destination);
                if dests.is_empty() {
                    self.route_destinations_by_subnet.remove(&old.subnet_id);
                }
            }
        }
        self.route_destinations_by_subnet
            .entry(subnet_id.to_string())
            .or_default()
            .insert(destination);
    }

    pub fn add_pool(&mut self, subnet_id: &str, pool_id: &str) {
        self.pool_ids_by_subnet
            .entry(subnet_id.to_string())
            .or_default()
            .insert(pool_id.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.routes_by_destination.is_empty()
            && self.route_destinations_by_subnet.is_empty()
            && self.pool_ids_by_subnet.is_empty()
    }

    /// Returns true if `addr` is a desired destination.
    ///
    /// Matches on the destination's address, whatever its prefix length.
    pub fn wants_address(&self, addr: Ipv4Addr) -> bool {
        self.routes_by_destination.contains_key(&host_net(addr))
            || self.routes_by_destination.keys().any(|dest| dest.addr() == addr)
    }

    /// Number of destinations needed in `subnet_id`.
    pub fn destinations_in_subnet(&self, subnet_id: &str) -> usize {
        self.route_destinations_by_subnet
            .get(subnet_id)
            .map_or(0, BTreeSet::len)
    }
}

/// One route in a [`DesiredStateFile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: Ipv4Net,
    pub subnet_id: String,
}

/// On-disk form of the desired state, as read by the development binary.
///
/// ```json
/// {
///   "routes": [{"destination": "100.64.0.10/32", "subnet_id": "subnet-dev"}],
///   "pools": {"subnet-dev": ["pool-dev"]}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredStateFile {
    pub routes: Vec<RouteEntry>,
    pub pools: BTreeMap<String, Vec<String>>,
}

impl From<DesiredStateFile> for DesiredState {
    fn from(file: DesiredStateFile) -> Self {
        let mut desired = DesiredState::default();
        for route in file.routes {
            desired.add_route(route.destination, &route.subnet_id);
        }
        for (subnet_id, pools) in file.pools {
            for pool in pools {
                desired.add_pool(&subnet_id, &pool);
            }
        }
        desired
    }
}

/// A secondary interface as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Iface {
    pub id: String,
    pub mac: MacAddr,
    pub primary_address: Option<Ipv4Addr>,
    pub secondary_addresses: Vec<Ipv4Addr>,
}

/// Secondary interface state of this instance.
///
/// The default value means no secondary subnet is currently needed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IfaceState {
    pub primary_mac: Option<MacAddr>,
    pub secondary_ifaces_by_mac: BTreeMap<MacAddr, Iface>,
    pub subnet_cidr: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
}

impl IfaceState {
    /// Every secondary address across all interfaces.
    pub fn secondary_addresses(&self) -> BTreeSet<Ipv4Addr> {
        self.secondary_ifaces_by_mac
            .values()
            .flat_map(|i| i.secondary_addresses.iter().copied())
            .collect()
    }
}

/// Capacity figures published after each snapshot load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SecondaryIfaceCapacities {
    pub max_calico_secondary_ips: usize,
}
