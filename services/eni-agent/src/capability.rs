//! Network capability model of this instance.

use tracing::{info, warn};

use crate::cloud::InstanceNetworkInfo;

/// Product-imposed ceiling on interfaces per instance, primary included.
pub const MAX_INTERFACES_PER_INSTANCE: usize = 15;

/// Ceiling on secondary interfaces per instance.
pub const SECONDARY_INTERFACE_CAP: usize = MAX_INTERFACES_PER_INSTANCE - 1;

/// Interface and address limits of this instance.
///
/// Fetched once and cached; instance types do not change at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityModel {
    /// Maximum attached interfaces, clamped to [`MAX_INTERFACES_PER_INSTANCE`].
    pub max_interfaces: usize,
    /// Maximum IPv4 addresses per interface, primary included.
    pub max_ipv4_per_interface: usize,
    network_card_limits: Vec<usize>,
}

impl CapabilityModel {
    pub fn new(info: &InstanceNetworkInfo) -> Self {
        let mut max_interfaces = info.max_network_interfaces;
        if max_interfaces > MAX_INTERFACES_PER_INSTANCE {
            info!(
                supported = max_interfaces,
                cap = MAX_INTERFACES_PER_INSTANCE,
                "Instance type supports more interfaces than we use, clamping"
            );
            max_interfaces = MAX_INTERFACES_PER_INSTANCE;
        }
        Self {
            max_interfaces,
            max_ipv4_per_interface: info.ipv4_per_interface,
            network_card_limits: info.network_card_limits.clone(),
        }
    }

    /// Interface limit of one network card; 0 for an unknown card.
    pub fn max_interfaces_for_card(&self, card: usize) -> usize {
        match self.network_card_limits.get(card) {
            Some(limit) => *limit,
            None => {
                warn!(card, "Asked about a network card that doesn't exist");
                0
            }
        }
    }

    /// Secondary addresses one interface can hold; 0 when the instance type
    /// supports none.
    pub fn secondary_addresses_per_interface(&self) -> usize {
        self.max_ipv4_per_interface.saturating_sub(1)
    }

    /// Ceiling on secondary addresses this controller can provide, given the
    /// number of attached interfaces it does not own.
    pub fn max_secondary_addresses(&self, non_owned_interfaces: usize) -> usize {
        let owned_capacity = self
            .max_interfaces
            .saturating_sub(non_owned_interfaces)
            .min(SECONDARY_INTERFACE_CAP);
        owned_capacity.saturating_mul(self.secondary_addresses_per_interface())
    }
}
