//! Selection of the single subnet secondary interfaces are created in.
//!
//! Only one subnet is supported per node. Normally the IP pools name exactly
//! one local subnet; during pool migrations several may qualify and the
//! scores below keep the choice stable.

use std::collections::BTreeMap;

use tracing::debug;

use crate::cloud::Subnet;
use crate::snapshot::CloudStateSnapshot;
use crate::types::DesiredState;

/// Score for a subnet backed by an IP pool.
const POOL_SCORE: u64 = 1_000_000;

/// Score per owned interface already in a subnet.
const IFACE_SCORE: u64 = 10_000;

/// Score per desired route in a subnet.
const ROUTE_SCORE: u64 = 1;

/// Pick the best local subnet, or `None` if no subnet is needed.
///
/// Ties go to the lexicographically greatest subnet ID.
pub fn calculate_best_subnet<'a>(
    desired: &DesiredState,
    snapshot: &CloudStateSnapshot,
    local_subnets: &'a BTreeMap<String, Subnet>,
) -> Option<&'a Subnet> {
    let mut scores: BTreeMap<&str, u64> = BTreeMap::new();

    for subnet_id in desired.pool_ids_by_subnet.keys() {
        if local_subnets.contains_key(subnet_id) {
            *scores.entry(subnet_id).or_default() += POOL_SCORE;
        }
    }
    for (subnet_id, ids) in &snapshot.iface_ids_by_subnet {
        *scores.entry(subnet_id).or_default() += IFACE_SCORE * ids.len() as u64;
    }
    for route in desired.routes_by_destination.values() {
        *scores.entry(&route.subnet_id).or_default() += ROUTE_SCORE;
    }

    // Iteration is in ascending ID order, so `>=` lets later IDs win ties.
    let mut best: Option<(&str, u64)> = None;
    for (subnet_id, score) in scores {
        if score == 0 || !local_subnets.contains_key(subnet_id) {
            continue;
        }
        if best.is_none_or(|(_, best_score)| score >= best_score) {
            best = Some((subnet_id, score));
        }
    }

    debug!(best = ?best, "Calculated best subnet");
    best.and_then(|(id, _)| local_subnets.get(id))
}
