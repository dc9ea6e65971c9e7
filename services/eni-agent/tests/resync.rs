//! Resync engine scenarios against the in-memory cloud and IPAM.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eni_agent::cloud::{
    Attachment, CloudError, CloudOp, FakeCloud, InstanceNetworkInfo, InterfaceStatus,
    NetworkInterface, PrivateAddress,
};
use eni_agent::health::{HealthAggregator, HealthReport, HealthSink, HEALTH_ENI_CAPACITY};
use eni_agent::ipam::{secondary_iface_handle, InMemoryIpam, IntendedUse, IpamError, IpamOp};
use eni_agent::{
    DesiredState, IfaceState, ProvisionerConfig, ResyncEngine, ResyncError,
    SecondaryIfaceCapacities,
};
use eni_networking::host_net;
use proptest::prelude::*;
use tokio::sync::watch;

const INSTANCE_ID: &str = "i-0123456789abcdef0";
const NODE: &str = "node-1";

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

struct Fixture {
    cloud: FakeCloud,
    ipam: InMemoryIpam,
    health: Arc<HealthAggregator>,
    capacities: Arc<Mutex<Vec<SecondaryIfaceCapacities>>>,
    engine: ResyncEngine,
    shutdown: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
}

impl Fixture {
    fn new(max_interfaces: usize, ipv4_per_interface: usize) -> Self {
        Self::with_config(max_interfaces, ipv4_per_interface, ProvisionerConfig::default())
    }

    fn with_config(
        max_interfaces: usize,
        ipv4_per_interface: usize,
        config: ProvisionerConfig,
    ) -> Self {
        let cloud = FakeCloud::new(
            INSTANCE_ID,
            "m5.large",
            InstanceNetworkInfo {
                max_network_interfaces: max_interfaces,
                ipv4_per_interface,
                network_card_limits: vec![max_interfaces],
            },
        );
        cloud.add_subnet("subnet-primary", "172.31.0.0/24".parse().unwrap());
        cloud.add_subnet("subnet-a", "10.0.0.0/24".parse().unwrap());
        cloud.add_subnet("subnet-b", "10.0.1.0/24".parse().unwrap());
        cloud.add_primary_interface("subnet-primary", ip("172.31.0.10"), &["sg-primary"]);

        let ipam = InMemoryIpam::new();
        ipam.add_pool("10.0.0.0/24".parse().unwrap(), IntendedUse::HostSecondary, Some("subnet-a"));
        ipam.add_pool("10.0.1.0/24".parse().unwrap(), IntendedUse::HostSecondary, Some("subnet-b"));

        let health = Arc::new(HealthAggregator::new());
        health.register_check(HEALTH_ENI_CAPACITY, HealthReport::HEALTHY, None);

        let capacities = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&capacities);
        let engine = ResyncEngine::new(
            &ProvisionerConfig {
                node_name: NODE.to_string(),
                ..config
            },
            Arc::new(cloud.clone()),
            Arc::new(ipam.clone()),
            health.clone(),
        )
        .with_capacity_callback(Arc::new(move |caps: SecondaryIfaceCapacities| {
            sink.lock().unwrap().push(caps)
        }));

        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            cloud,
            ipam,
            health,
            capacities,
            engine,
            shutdown,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn resync(&mut self) -> Result<IfaceState, ResyncError> {
        self.engine.resync(&self.shutdown).await
    }

    fn owned_ids(&self) -> Vec<String> {
        self.cloud
            .attached_interfaces()
            .into_iter()
            .filter(|i| i.is_owned())
            .map(|i| i.id)
            .collect()
    }
}

fn assigned_addresses(cloud: &FakeCloud) -> Vec<Ipv4Addr> {
    cloud
        .calls()
        .into_iter()
        .filter(|c| c.op == CloudOp::AssignAddresses)
        .flat_map(|c| c.addresses)
        .collect()
}

fn desired(pools: &[&str], routes: &[(&str, &str)]) -> DesiredState {
    let mut desired = DesiredState::default();
    for subnet in pools {
        desired.add_pool(subnet, &format!("pool-{subnet}"));
    }
    for (addr, subnet) in routes {
        desired.add_route(host_net(ip(addr)), subnet);
    }
    desired
}

#[tokio::test]
async fn test_empty_desired_state_makes_no_changes() {
    let mut f = Fixture::new(4, 4);
    f.engine.set_desired(DesiredState::default());

    let state = f.resync().await.unwrap();
    assert_eq!(state, IfaceState::default());
    assert!(f.cloud.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_subnet_tie_prefers_greatest_id() {
    let mut f = Fixture::new(4, 4);
    f.engine.set_desired(desired(&["subnet-a", "subnet-b"], &[]));

    let state = f.resync().await.unwrap();
    assert_eq!(state.subnet_cidr, Some("10.0.1.0/24".parse().unwrap()));
    assert_eq!(state.gateway, Some(ip("10.0.1.1")));
    assert!(state.primary_mac.is_some());
    assert!(state.secondary_ifaces_by_mac.is_empty());
    assert!(f.cloud.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_creates_interface_and_assigns_addresses() {
    let mut f = Fixture::new(4, 4);
    f.engine.set_desired(desired(
        &["subnet-a"],
        &[("10.0.0.100", "subnet-a"), ("10.0.0.101", "subnet-a")],
    ));

    let state = f.resync().await.unwrap();

    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 1);
    let owned = f.owned_ids();
    assert_eq!(owned.len(), 1);
    let iface = f.cloud.interface(&owned[0]).unwrap();
    assert_eq!(iface.subnet_id, "subnet-a");
    assert_eq!(iface.security_groups, vec!["sg-primary".to_string()]);
    assert_eq!(iface.owning_instance(), Some(INSTANCE_ID));
    assert_eq!(iface.attachment.as_ref().unwrap().device_index, 1);
    assert!(iface.attachment.as_ref().unwrap().delete_on_termination);

    assert_eq!(state.subnet_cidr, Some("10.0.0.0/24".parse().unwrap()));
    assert_eq!(state.gateway, Some(ip("10.0.0.1")));
    assert_eq!(state.secondary_ifaces_by_mac.len(), 1);
    let reported = state.secondary_ifaces_by_mac.values().next().unwrap();
    assert_eq!(reported.id, iface.id);
    assert_eq!(reported.primary_address, Some(ip("10.0.0.2")));
    assert_eq!(
        state.secondary_addresses().into_iter().collect::<Vec<_>>(),
        vec![ip("10.0.0.100"), ip("10.0.0.101")]
    );

    let requests = f.ipam.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].num4, 1);
    assert_eq!(requests[0].handle, secondary_iface_handle(NODE));
    assert_eq!(requests[0].subnet_ids, vec!["subnet-a".to_string()]);
}

#[tokio::test]
async fn test_second_resync_is_idempotent() {
    let mut f = Fixture::new(4, 4);
    f.engine.set_desired(desired(
        &["subnet-a"],
        &[("10.0.0.100", "subnet-a"), ("10.0.0.101", "subnet-a")],
    ));
    let first = f.resync().await.unwrap();
    f.cloud.clear_calls();

    let second = f.resync().await.unwrap();
    assert_eq!(first, second);
    assert!(f.cloud.mutating_calls().is_empty());
    assert_eq!(f.ipam.requests().len(), 1);
}

#[tokio::test]
async fn test_route_with_wide_prefix_is_idempotent() {
    let mut f = Fixture::new(4, 4);
    let mut desired = desired(&["subnet-a"], &[]);
    desired.add_route("10.0.0.100/24".parse().unwrap(), "subnet-a");
    f.engine.set_desired(desired);

    let first = f.resync().await.unwrap();
    assert_eq!(
        first.secondary_addresses().into_iter().collect::<Vec<_>>(),
        vec![ip("10.0.0.100")]
    );
    f.cloud.clear_calls();

    let second = f.resync().await.unwrap();
    assert_eq!(first, second);
    assert!(f.cloud.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_capacity_exhaustion_clamps_creation() {
    let mut f = Fixture::new(3, 2);
    f.cloud.add_owned_interface("subnet-a", ip("10.0.0.200"), &[]);
    let routes: Vec<(String, &str)> = (100..106)
        .map(|i| (format!("10.0.0.{i}"), "subnet-a"))
        .collect();
    let routes: Vec<(&str, &str)> = routes.iter().map(|(a, s)| (a.as_str(), *s)).collect();
    f.engine.set_desired(desired(&["subnet-a"], &routes));

    let state = f.resync().await.unwrap();

    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 1);
    assert_eq!(f.cloud.attached_interfaces().len(), 3);
    assert_eq!(f.health.get(HEALTH_ENI_CAPACITY), Some(HealthReport::ready(false)));
    // One slot on each of the two secondary interfaces.
    assert_eq!(state.secondary_addresses().len(), 2);
}

#[tokio::test]
async fn test_capacity_callback_reports_instance_limit() {
    let mut f = Fixture::new(3, 2);
    f.engine.set_desired(desired(&["subnet-a"], &[]));
    f.resync().await.unwrap();

    let capacities = f.capacities.lock().unwrap().clone();
    assert_eq!(
        capacities.last(),
        Some(&SecondaryIfaceCapacities {
            max_calico_secondary_ips: 2
        })
    );
}

#[tokio::test]
async fn test_stale_address_unassigned_then_restart() {
    let mut f = Fixture::new(4, 4);
    let owned = f
        .cloud
        .add_owned_interface("subnet-a", ip("10.0.0.200"), &[ip("10.0.0.5"), ip("10.0.0.100")]);
    f.engine
        .set_desired(desired(&["subnet-a"], &[("10.0.0.100", "subnet-a")]));

    let phase = f.engine.attempt_resync().await.unwrap();
    assert!(phase.is_restart());
    let unassigns: Vec<_> = f
        .cloud
        .calls()
        .into_iter()
        .filter(|c| c.op == CloudOp::UnassignAddresses)
        .collect();
    assert_eq!(unassigns.len(), 1);
    assert_eq!(unassigns[0].target, owned);
    assert_eq!(unassigns[0].addresses, vec![ip("10.0.0.5")]);

    let state = f.resync().await.unwrap();
    assert_eq!(
        state.secondary_addresses().into_iter().collect::<Vec<_>>(),
        vec![ip("10.0.0.100")]
    );
    assert_eq!(f.cloud.call_count(CloudOp::UnassignAddresses), 1);
}

#[tokio::test]
async fn test_addresses_only_added_in_one_subnet() {
    let mut f = Fixture::new(4, 4);
    f.engine.set_desired(desired(
        &["subnet-a", "subnet-b"],
        &[
            ("10.0.0.100", "subnet-a"),
            ("10.0.0.101", "subnet-a"),
            ("10.0.1.100", "subnet-b"),
        ],
    ));

    let state = f.resync().await.unwrap();

    for id in f.owned_ids() {
        assert_eq!(f.cloud.interface(&id).unwrap().subnet_id, "subnet-a");
    }
    let addrs = state.secondary_addresses();
    assert!(addrs.contains(&ip("10.0.0.100")));
    assert!(!addrs.contains(&ip("10.0.1.100")));
}

#[tokio::test]
async fn test_non_local_and_clashing_addresses_skipped() {
    let mut f = Fixture::new(4, 4);
    f.cloud
        .add_subnet_in_zone("subnet-remote", Some("10.9.0.0/24".parse().unwrap()), "us-west-2b");
    f.cloud.add_owned_interface("subnet-a", ip("10.0.0.200"), &[]);
    f.engine.set_desired(desired(
        &["subnet-a"],
        &[
            ("10.9.0.100", "subnet-remote"),
            // Primary address of the owned interface.
            ("10.0.0.200", "subnet-a"),
            ("10.0.0.100", "subnet-a"),
        ],
    ));

    let state = f.resync().await.unwrap();
    assert_eq!(
        state.secondary_addresses().into_iter().collect::<Vec<_>>(),
        vec![ip("10.0.0.100")]
    );
    assert_eq!(f.cloud.call_count(CloudOp::AssignAddresses), 1);
}

#[tokio::test]
async fn test_address_on_foreign_interface_not_taken() {
    let mut f = Fixture::new(4, 4);
    f.cloud.insert_interface(NetworkInterface {
        id: "eni-foreign".to_string(),
        subnet_id: "subnet-a".to_string(),
        description: "Managed elsewhere".to_string(),
        mac_address: Some("0a:00:00:00:0f:01".to_string()),
        private_addresses: vec![
            PrivateAddress {
                address: ip("10.0.0.40"),
                primary: true,
            },
            PrivateAddress {
                address: ip("10.0.0.50"),
                primary: false,
            },
        ],
        attachment: Some(Attachment {
            id: "eni-attach-foreign".to_string(),
            device_index: 1,
            network_card_index: 0,
            delete_on_termination: true,
        }),
        security_groups: Vec::new(),
        tags: BTreeMap::new(),
        status: InterfaceStatus::InUse,
    });
    f.engine.set_desired(desired(
        &["subnet-a"],
        &[("10.0.0.50", "subnet-a"), ("10.0.0.100", "subnet-a")],
    ));

    let state = f.resync().await.unwrap();
    assert_eq!(
        state.secondary_addresses().into_iter().collect::<Vec<_>>(),
        vec![ip("10.0.0.100")]
    );
    assert_eq!(assigned_addresses(&f.cloud), vec![ip("10.0.0.100")]);
    let foreign = f.cloud.interface("eni-foreign").unwrap();
    assert!(foreign
        .private_addresses
        .iter()
        .any(|a| a.address == ip("10.0.0.50")));
}

#[tokio::test]
async fn test_orphans_attached_or_deleted() {
    let mut f = Fixture::new(4, 4);
    let keep = f.cloud.add_unattached_owned_interface("subnet-a", ip("10.0.0.210"));
    let drop = f.cloud.add_unattached_owned_interface("subnet-b", ip("10.0.1.210"));
    f.engine
        .set_desired(desired(&["subnet-a"], &[("10.0.0.100", "subnet-a")]));

    let phase = f.engine.attempt_resync().await.unwrap();
    assert!(phase.is_restart());
    assert!(f.cloud.interface(&drop).is_none());
    assert!(f.cloud.interface(&keep).unwrap().attachment.is_some());

    let state = f.resync().await.unwrap();
    assert!(!f.engine.orphan_scan_needed());
    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 0);

    // Attached without delete-on-termination; the next pass fixes that.
    let kept = f.cloud.interface(&keep).unwrap();
    assert!(kept.attachment.as_ref().unwrap().delete_on_termination);
    assert_eq!(kept.secondary_addresses(), vec![ip("10.0.0.100")]);
    assert_eq!(state.secondary_ifaces_by_mac.len(), 1);
}

#[tokio::test]
async fn test_interface_without_pool_released() {
    let mut f = Fixture::new(4, 4);
    f.engine
        .set_desired(desired(&["subnet-a"], &[("10.0.0.100", "subnet-a")]));
    f.resync().await.unwrap();
    assert!(!f.engine.host_ipam_scan_needed());
    f.engine.take_recheck_reset();

    let stray = f.cloud.add_owned_interface("subnet-b", ip("10.0.1.200"), &[]);
    let phase = f.engine.attempt_resync().await.unwrap();
    assert!(phase.is_restart());
    assert!(f.cloud.interface(&stray).is_none());
    assert_eq!(f.cloud.call_count(CloudOp::DetachInterface), 1);
    assert!(f.engine.host_ipam_scan_needed());
    assert!(f.engine.take_recheck_reset());
}

#[tokio::test]
async fn test_leaked_host_addresses_released() {
    let mut f = Fixture::new(4, 4);
    let handle = secondary_iface_handle(NODE);
    f.cloud.add_owned_interface("subnet-a", ip("10.0.0.200"), &[]);
    f.ipam.seed_allocation(&handle, ip("10.0.0.200"));
    f.ipam.seed_allocation(&handle, ip("10.0.0.50"));
    f.engine
        .set_desired(desired(&["subnet-a"], &[("10.0.0.100", "subnet-a")]));

    f.resync().await.unwrap();

    assert_eq!(
        f.ipam.allocated(&handle).into_iter().collect::<Vec<_>>(),
        vec![ip("10.0.0.200")]
    );
    assert!(!f.engine.host_ipam_scan_needed());
    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 0);
}

#[tokio::test]
async fn test_partial_creation_failure_recovers() {
    let mut f = Fixture::new(4, 2);
    f.engine.set_desired(desired(
        &["subnet-a"],
        &[
            ("10.0.0.100", "subnet-a"),
            ("10.0.0.101", "subnet-a"),
            ("10.0.0.102", "subnet-a"),
            ("10.0.0.103", "subnet-a"),
        ],
    ));
    f.cloud.fail_next(
        CloudOp::AttachInterface,
        CloudError::InvalidParameter {
            operation: "AttachNetworkInterface",
            reason: "attachment limit exceeded".to_string(),
        },
    );

    let err = f.resync().await.unwrap_err();
    assert!(matches!(err, ResyncError::PartialFailure(_)));
    assert!(f.engine.orphan_scan_needed());
    assert!(f.engine.host_ipam_scan_needed());
    assert!(!f.engine.has_cloud_client());
    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 3);
    assert_eq!(f.owned_ids().len(), 2);

    // The unattached interface is picked up by the orphan scan.
    let state = f.resync().await.unwrap();
    assert_eq!(f.owned_ids().len(), 3);
    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 3);
    assert_eq!(state.secondary_ifaces_by_mac.len(), 3);
    assert_eq!(state.secondary_addresses().len(), 3);
    assert_eq!(f.health.get(HEALTH_ENI_CAPACITY), Some(HealthReport::ready(false)));
}

#[tokio::test]
async fn test_ipam_failure_aborts_before_creating_interfaces() {
    let mut f = Fixture::new(4, 4);
    f.engine
        .set_desired(desired(&["subnet-a"], &[("10.0.0.100", "subnet-a")]));
    f.ipam.fail_next(
        IpamOp::AutoAssign,
        IpamError::Datastore("connection refused".to_string()),
    );

    let err = f.resync().await.unwrap_err();
    assert!(matches!(err, ResyncError::Ipam(IpamError::Datastore(_))));
    assert!(f.engine.host_ipam_scan_needed());
    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 0);

    // The host address scan runs again before the next allocation.
    let state = f.resync().await.unwrap();
    assert!(!f.engine.host_ipam_scan_needed());
    assert_eq!(f.ipam.call_count(IpamOp::ByHandle), 2);
    assert_eq!(state.secondary_addresses().len(), 1);
}

#[tokio::test]
async fn test_empty_allocation_aborts_resync() {
    let mut f = Fixture::new(4, 4);
    // No IP pool backs this subnet on the IPAM side.
    f.cloud.add_subnet("subnet-c", "10.0.2.0/24".parse().unwrap());
    f.engine
        .set_desired(desired(&["subnet-c"], &[("10.0.2.100", "subnet-c")]));

    let err = f.resync().await.unwrap_err();
    assert!(matches!(
        err,
        ResyncError::Ipam(IpamError::NoAddressesAvailable { requested: 1 })
    ));
    assert!(f.engine.host_ipam_scan_needed());
    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 0);
}

#[tokio::test]
async fn test_short_allocation_creates_fewer_interfaces() {
    let mut f = Fixture::new(4, 2);
    f.cloud.add_subnet("subnet-c", "10.0.2.0/24".parse().unwrap());
    // Only 10.0.2.2 is allocatable from a /30.
    f.ipam.add_pool("10.0.2.0/30".parse().unwrap(), IntendedUse::HostSecondary, Some("subnet-c"));
    f.engine.set_desired(desired(
        &["subnet-c"],
        &[
            ("10.0.2.100", "subnet-c"),
            ("10.0.2.101", "subnet-c"),
            ("10.0.2.102", "subnet-c"),
        ],
    ));

    let state = f.resync().await.unwrap();
    assert_eq!(f.ipam.requests()[0].num4, 3);
    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 1);
    assert!(!f.engine.host_ipam_scan_needed());

    let ifaces: Vec<_> = state.secondary_ifaces_by_mac.values().collect();
    assert_eq!(ifaces.len(), 1);
    assert_eq!(ifaces[0].primary_address, Some(ip("10.0.2.2")));
    assert_eq!(ifaces[0].secondary_addresses, vec![ip("10.0.2.100")]);
}

#[tokio::test]
async fn test_primary_without_mac_is_fatal() {
    let mut f = Fixture::new(4, 4);
    let mut primary = f
        .cloud
        .attached_interfaces()
        .into_iter()
        .find(|i| !i.is_owned())
        .unwrap();
    primary.mac_address = None;
    f.cloud.insert_interface(primary);
    f.engine.set_desired(desired(&["subnet-a"], &[]));

    let err = f.resync().await.unwrap_err();
    assert!(matches!(err, ResyncError::MissingMac { .. }));
}

#[tokio::test]
async fn test_secondary_without_mac_is_skipped() {
    let mut f = Fixture::new(4, 4);
    let owned = f.cloud.add_owned_interface("subnet-a", ip("10.0.0.200"), &[]);
    let mut iface = f.cloud.interface(&owned).unwrap();
    iface.mac_address = None;
    f.cloud.insert_interface(iface);
    f.engine.set_desired(desired(&["subnet-a"], &[]));

    let state = f.resync().await.unwrap();
    assert!(state.primary_mac.is_some());
    assert!(state.secondary_ifaces_by_mac.is_empty());
}

#[tokio::test]
async fn test_subnet_without_cidr_is_fatal() {
    let mut f = Fixture::new(4, 4);
    f.cloud.add_subnet_in_zone("subnet-c", None, "us-west-2a");
    f.engine.set_desired(desired(&["subnet-c"], &[]));

    let err = f.resync().await.unwrap_err();
    assert!(matches!(err, ResyncError::SubnetMissingCidr { subnet_id } if subnet_id == "subnet-c"));
}

#[tokio::test]
async fn test_single_address_interfaces_rejected() {
    let mut f = Fixture::new(4, 1);
    f.engine
        .set_desired(desired(&["subnet-a"], &[("10.0.0.100", "subnet-a")]));

    let err = f.resync().await.unwrap_err();
    assert!(matches!(
        err,
        ResyncError::NoSecondaryAddressSupport {
            max_ipv4_per_interface: 1
        }
    ));
    assert_eq!(f.cloud.call_count(CloudOp::CreateInterface), 0);
}

#[tokio::test]
async fn test_subnets_file_lists_local_subnets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aws-subnets");
    let mut f = Fixture::with_config(
        4,
        4,
        ProvisionerConfig {
            subnets_file: Some(path.clone()),
            ..ProvisionerConfig::default()
        },
    );
    f.cloud
        .add_subnet_in_zone("subnet-remote", Some("10.9.0.0/24".parse().unwrap()), "us-west-2b");
    f.engine.set_desired(desired(&["subnet-a"], &[]));

    f.resync().await.unwrap();
    f.resync().await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        r#"{"aws_subnet_ids":["subnet-a","subnet-b","subnet-primary"]}"#
    );
}

#[tokio::test]
async fn test_delete_on_termination_enforced() {
    let mut f = Fixture::new(4, 4);
    let owned = f.cloud.add_owned_interface("subnet-a", ip("10.0.0.200"), &[]);
    let mut iface = f.cloud.interface(&owned).unwrap();
    if let Some(att) = iface.attachment.as_mut() {
        att.delete_on_termination = false;
    }
    f.cloud.insert_interface(iface);
    f.engine.set_desired(desired(&["subnet-a"], &[]));

    f.resync().await.unwrap();
    assert_eq!(f.cloud.call_count(CloudOp::SetDeleteOnTermination), 1);
    assert!(f
        .cloud
        .interface(&owned)
        .unwrap()
        .attachment
        .unwrap()
        .delete_on_termination);
    assert!(f.engine.take_recheck_reset());
}

#[tokio::test(start_paused = true)]
async fn test_slow_cloud_call_times_out() {
    let mut f = Fixture::with_config(
        4,
        4,
        ProvisionerConfig {
            call_timeout: Duration::from_secs(1),
            ..ProvisionerConfig::default()
        },
    );
    f.cloud.set_latency(Duration::from_secs(5));
    f.engine.set_desired(desired(&["subnet-a"], &[]));

    let err = f.resync().await.unwrap_err();
    assert!(matches!(err, ResyncError::Timeout { .. }));
    assert!(!f.engine.has_cloud_client());
}

#[tokio::test]
async fn test_restarts_exhaust_attempts() {
    let mut f = Fixture::with_config(
        4,
        4,
        ProvisionerConfig {
            max_attempts: 1,
            ..ProvisionerConfig::default()
        },
    );
    f.cloud
        .add_owned_interface("subnet-a", ip("10.0.0.200"), &[ip("10.0.0.5")]);
    f.engine.set_desired(desired(&["subnet-a"], &[]));

    let err = f.resync().await.unwrap_err();
    assert!(matches!(err, ResyncError::AttemptsExhausted { attempts: 1 }));
    assert!(f.engine.resync_needed());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_stays_within_capacity_and_never_double_assigns(
        max_interfaces in 2usize..6,
        ipv4_per_interface in 2usize..5,
        owned in 0usize..4,
        routes in 0usize..40,
    ) {
        let owned = owned.min(max_interfaces - 1);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut f = Fixture::new(max_interfaces, ipv4_per_interface);
            // Each owned interface already holds one address that may or may
            // not still be wanted.
            for i in 0..owned {
                let i = i as u8;
                f.cloud.add_owned_interface(
                    "subnet-a",
                    Ipv4Addr::new(10, 0, 0, 200 + i),
                    &[Ipv4Addr::new(10, 0, 0, 100 + i)],
                );
            }
            let before: BTreeSet<Ipv4Addr> = f
                .cloud
                .interfaces()
                .iter()
                .flat_map(|iface| iface.private_addresses.iter().map(|a| a.address))
                .collect();
            let addrs: Vec<String> = (0..routes).map(|i| format!("10.0.0.{}", 100 + i)).collect();
            let routes: Vec<(&str, &str)> =
                addrs.iter().map(|a| (a.as_str(), "subnet-a")).collect();
            f.engine.set_desired(desired(&["subnet-a"], &routes));

            let state = f.resync().await;
            prop_assert!(state.is_ok(), "resync failed: {:?}", state.err());
            prop_assert!(
                f.cloud.call_count(CloudOp::CreateInterface) <= max_interfaces - 1 - owned
            );
            prop_assert!(f.cloud.attached_interfaces().len() <= max_interfaces);

            let assigned = assigned_addresses(&f.cloud);
            let unique: BTreeSet<Ipv4Addr> = assigned.iter().copied().collect();
            prop_assert_eq!(unique.len(), assigned.len(), "assigned twice: {:?}", assigned);
            prop_assert!(unique.is_disjoint(&before), "reassigned: {:?}", assigned);
            Ok(())
        })?;
    }
}
