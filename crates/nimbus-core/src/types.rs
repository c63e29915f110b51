use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// Store-assigned row id for a network
pub type NetworkId = u64;

/// Store-assigned row id for a virtual interface
pub type VifId = u64;

/// Opaque instance identifier; the core only cares about project ownership
pub type InstanceId = Uuid;

/// Project identifier
pub type ProjectId = String;

/// A logical network owned by at most one network host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub label: String,
    /// IPv4 block this network allocates from
    pub cidr: Ipv4Net,
    pub cidr_v6: Option<Ipv6Net>,
    pub netmask: Ipv4Addr,
    /// Prefix length of the v6 subnet (64 when v6 is enabled)
    pub netmask_v6: Option<u8>,
    pub gateway: Ipv4Addr,
    pub gateway_v6: Option<Ipv6Addr>,
    pub broadcast: Ipv4Addr,
    pub bridge: String,
    pub bridge_interface: Option<String>,
    /// VLAN tag; present only for VLAN-mode networks
    pub vlan: Option<u16>,
    pub vpn_public_address: Option<Ipv4Addr>,
    pub vpn_public_port: Option<u16>,
    pub vpn_private_address: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    /// First address handed out by dhcp
    pub dhcp_start: Ipv4Addr,
    /// Whether network config is injected into the guest
    pub injected: bool,
    /// Every compute host runs its own dhcp/bridge for this network
    pub multi_host: bool,
    /// Network host that has claimed this network, if any
    pub host: Option<String>,
    pub project_id: Option<ProjectId>,
}

/// An address in a private range, materialized at network creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedIp {
    pub id: u64,
    pub address: Ipv4Addr,
    pub network_id: NetworkId,
    pub instance_id: Option<InstanceId>,
    pub virtual_interface_id: Option<VifId>,
    /// Bound to an instance and its interface
    pub allocated: bool,
    /// The dhcp daemon has handed this address out
    pub leased: bool,
    /// Never returned by the allocation pool (network address, gateway, ...)
    pub reserved: bool,
    pub updated_at: DateTime<Utc>,
}

impl FixedIp {
    /// A free pool entry for a network, as created at network creation time
    pub fn unassociated(network_id: NetworkId, address: Ipv4Addr, reserved: bool) -> Self {
        Self {
            id: 0,
            address,
            network_id,
            instance_id: None,
            virtual_interface_id: None,
            allocated: false,
            leased: false,
            reserved,
            updated_at: Utc::now(),
        }
    }
}

/// The (MAC, instance, network) binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualInterface {
    pub id: VifId,
    /// MAC address, unique deployment-wide, `02:16:3e:xx:xx:xx`
    pub mac: String,
    pub instance_id: InstanceId,
    pub network_id: NetworkId,
}

/// A publicly-routable address bindable to a fixed IP on demand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: u64,
    pub address: Ipv4Addr,
    /// Owning project while allocated; None while in the free pool
    pub project_id: Option<ProjectId>,
    pub fixed_ip_id: Option<u64>,
    /// Host serving the association, recorded at associate time
    pub host: Option<String>,
    /// Released automatically on instance deallocation
    pub auto_assigned: bool,
}

/// Instance flavor; only the rxtx cap matters to the network layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceType {
    pub id: u64,
    pub name: String,
    pub rxtx_cap: u32,
}

/// Network half of a network-info pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub id: NetworkId,
    pub bridge: String,
    pub cidr: Ipv4Net,
    pub cidr_v6: Option<Ipv6Net>,
    pub injected: bool,
}

/// One v4 address entry in an interface's info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpEntry {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub enabled: String,
}

/// One v6 address entry in an interface's info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ip6Entry {
    pub ip: Ipv6Addr,
    pub netmask: u8,
    pub enabled: String,
}

/// Interface half of a network-info pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub label: String,
    pub gateway: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub mac: String,
    pub rxtx_cap: u32,
    pub dns: Vec<Ipv4Addr>,
    pub ips: Vec<IpEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip6s: Option<Vec<Ip6Entry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway6: Option<Ipv6Addr>,
}

/// What an instance needs to configure its interfaces, one pair per VIF
pub type NetworkInfo = Vec<(NetworkDescriptor, InterfaceInfo)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unassociated_fixed_ip_is_free() {
        let ip = FixedIp::unassociated(1, Ipv4Addr::new(10, 0, 0, 3), false);
        assert!(!ip.allocated);
        assert!(!ip.leased);
        assert!(!ip.reserved);
        assert!(ip.instance_id.is_none());
        assert!(ip.virtual_interface_id.is_none());
    }

    #[test]
    fn test_interface_info_serializes_without_empty_v6() {
        let info = InterfaceInfo {
            label: "net".to_string(),
            gateway: Ipv4Addr::new(192, 168, 0, 1),
            broadcast: Ipv4Addr::new(192, 168, 0, 255),
            mac: "02:16:3e:00:00:01".to_string(),
            rxtx_cap: 0,
            dns: vec![],
            ips: vec![],
            ip6s: None,
            gateway6: None,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("ip6s").is_none());
        assert!(value.get("gateway6").is_none());
    }
}
