//! Indexed view of this instance's interfaces, and the per-attempt scratch
//! state derived from it.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use tracing::{debug, error};

use crate::capability::CapabilityModel;
use crate::cloud::NetworkInterface;

/// Interfaces attached to this instance, indexed for the resync phases.
///
/// Only interfaces on network card 0 are indexed. Rebuilt from a fresh
/// listing at the start of every attempt.
#[derive(Debug, Clone, Default)]
pub struct CloudStateSnapshot {
    /// The instance's primary interface.
    pub primary: Option<NetworkInterface>,
    /// Interfaces this controller owns.
    pub owned_by_id: BTreeMap<String, NetworkInterface>,
    /// Everything else, the primary included.
    pub non_owned_by_id: BTreeMap<String, NetworkInterface>,
    /// Owned interface IDs by subnet.
    pub iface_ids_by_subnet: BTreeMap<String, Vec<String>>,
    /// Secondary address on an owned interface -> interface ID.
    pub iface_id_by_secondary_addr: BTreeMap<Ipv4Addr, String>,
    /// Primary address of an owned interface -> interface ID.
    pub iface_id_by_primary_addr: BTreeMap<Ipv4Addr, String>,
    /// Every address on a non-owned interface.
    pub foreign_addresses: BTreeSet<Ipv4Addr>,
    pub attachment_id_by_iface_id: BTreeMap<String, String>,
}

impl CloudStateSnapshot {
    /// Index `interfaces` and derive the working state in the same pass.
    pub fn build(
        interfaces: Vec<NetworkInterface>,
        caps: &CapabilityModel,
    ) -> (Self, ResyncWorkingState) {
        let mut snapshot = Self::default();
        let mut working = ResyncWorkingState::default();

        for iface in interfaces {
            if let Some(att) = &iface.attachment {
                working.total_attached += 1;
                if att.network_card_index != 0 {
                    debug!(
                        iface_id = %iface.id,
                        card = att.network_card_index,
                        "Ignoring interface on non-primary network card"
                    );
                    continue;
                }
                working.occupied_device_indexes.insert(att.device_index);
                snapshot
                    .attachment_id_by_iface_id
                    .insert(iface.id.clone(), att.id.clone());
            }

            if !iface.is_owned() {
                let at_index_zero = iface.attachment.as_ref().is_some_and(|a| a.device_index == 0);
                if snapshot.primary.is_none() || at_index_zero {
                    snapshot.primary = Some(iface.clone());
                }
                snapshot
                    .foreign_addresses
                    .extend(iface.private_addresses.iter().map(|a| a.address));
                snapshot.non_owned_by_id.insert(iface.id.clone(), iface);
                continue;
            }

            debug!(iface_id = %iface.id, subnet = %iface.subnet_id, "Found owned interface");
            snapshot
                .iface_ids_by_subnet
                .entry(iface.subnet_id.clone())
                .or_default()
                .push(iface.id.clone());
            if let Some(primary) = iface.primary_address() {
                snapshot
                    .iface_id_by_primary_addr
                    .insert(primary, iface.id.clone());
            }
            for addr in iface.secondary_addresses() {
                snapshot
                    .iface_id_by_secondary_addr
                    .insert(addr, iface.id.clone());
            }

            let used = iface.private_addresses.len();
            let free = match caps.max_ipv4_per_interface.checked_sub(used) {
                Some(free) => free,
                None => {
                    error!(
                        iface_id = %iface.id,
                        addresses = used,
                        limit = caps.max_ipv4_per_interface,
                        "Interface holds more addresses than its limit"
                    );
                    0
                }
            };
            working.set_free_slots(&iface.id, &iface.subnet_id, free);
            snapshot.owned_by_id.insert(iface.id.clone(), iface);
        }

        (snapshot, working)
    }

    /// Security groups of the primary interface, copied onto new interfaces.
    pub fn primary_security_groups(&self) -> Vec<String> {
        self.primary
            .as_ref()
            .map(|p| p.security_groups.clone())
            .unwrap_or_default()
    }

    /// Number of owned interfaces in `subnet_id`.
    pub fn owned_in_subnet(&self, subnet_id: &str) -> usize {
        self.iface_ids_by_subnet.get(subnet_id).map_or(0, Vec::len)
    }
}

/// Free address slots of one owned interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSlots {
    pub subnet_id: String,
    pub free: usize,
}

/// Scratch state of one resync attempt.
///
/// Tracks the device indexes in use on card 0 and the free address slots of
/// each owned interface. Dropped at the end of the attempt.
#[derive(Debug, Clone, Default)]
pub struct ResyncWorkingState {
    occupied_device_indexes: BTreeSet<u32>,
    total_attached: usize,
    free_slots: BTreeMap<String, FreeSlots>,
}

impl ResyncWorkingState {
    /// Lowest device index not in use on card 0.
    pub fn find_free_device_index(&self) -> u32 {
        let mut idx = 0;
        while self.occupied_device_indexes.contains(&idx) {
            idx += 1;
        }
        idx
    }

    /// Mark a device index as taken by an interface we are attaching.
    pub fn claim_device_index(&mut self, idx: u32) {
        if self.occupied_device_indexes.insert(idx) {
            self.total_attached += 1;
        }
    }

    /// Returns true if another interface can be attached to card 0.
    pub fn has_free_device_index(&self, caps: &CapabilityModel) -> bool {
        (self.find_free_device_index() as usize) < caps.max_interfaces_for_card(0)
            && self.total_attached < caps.max_interfaces
    }

    /// How many more interfaces can be attached.
    pub fn unused_interface_capacity(&self, caps: &CapabilityModel) -> usize {
        let card = caps
            .max_interfaces_for_card(0)
            .saturating_sub(self.occupied_device_indexes.len());
        let instance = caps.max_interfaces.saturating_sub(self.total_attached);
        card.min(instance)
    }

    pub fn set_free_slots(&mut self, iface_id: &str, subnet_id: &str, free: usize) {
        self.free_slots.insert(
            iface_id.to_string(),
            FreeSlots {
                subnet_id: subnet_id.to_string(),
                free,
            },
        );
    }

    pub fn free_slots(&self, iface_id: &str) -> usize {
        self.free_slots.get(iface_id).map_or(0, |s| s.free)
    }

    /// Interfaces in `subnet_id` with room for more addresses, in ID order.
    pub fn ifaces_with_room(&self, subnet_id: &str) -> Vec<(String, usize)> {
        self.free_slots
            .iter()
            .filter(|(_, s)| s.subnet_id == subnet_id && s.free > 0)
            .map(|(id, s)| (id.clone(), s.free))
            .collect()
    }

    /// Consume `n` slots of an interface.
    pub fn consume_slots(&mut self, iface_id: &str, n: usize) {
        if let Some(slots) = self.free_slots.get_mut(iface_id) {
            slots.free = slots.free.saturating_sub(n);
        }
    }
}
