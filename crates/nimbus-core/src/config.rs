use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Deployment configuration for a network host.
///
/// Passed by value into constructors; there is no process-global
/// configuration. Defaults mirror a conventional deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Backend selector for the packet-forwarding driver
    pub network_driver: String,
    /// Bridge device for flat network instances
    pub flat_network_bridge: String,
    /// Dns server handed to flat networks
    pub flat_network_dns: Ipv4Addr,
    /// Whether to inject network setup into the guest
    pub flat_injected: bool,
    /// FlatDHCP bridges into this interface if set
    pub flat_interface: Option<String>,
    /// Dhcp start for FlatDHCP
    pub flat_network_dhcp_start: Ipv4Addr,
    /// First VLAN for private networks
    pub vlan_start: u16,
    /// Vlans bridge into this interface if set
    pub vlan_interface: Option<String>,
    /// Number of networks to support
    pub num_networks: u32,
    /// Number of addresses in each private subnet
    pub network_size: u32,
    /// Public IP for the VPN endpoints
    pub vpn_ip: Option<Ipv4Addr>,
    /// First VPN port for private networks
    pub vpn_start: u16,
    /// Number of addresses reserved for vpn clients
    pub cnt_vpn_clients: usize,
    /// Floating IP address block
    pub floating_range: Ipv4Net,
    /// Fixed IP address block
    pub fixed_range: Ipv4Net,
    /// Fixed IPv6 address block
    pub fixed_range_v6: Ipv6Net,
    /// Default IPv6 gateway; per-subnet gateway derived when unset
    pub gateway_v6: Option<Ipv6Addr>,
    pub use_ipv6: bool,
    /// Whether to refresh dhcp when a fixed ip is disassociated
    pub update_dhcp_on_disassociate: bool,
    /// How long a deallocated ip keeps its instance association
    pub fixed_ip_disassociate_timeout: Duration,
    /// Attempts to create a unique mac address before giving up
    pub create_unique_mac_address_attempts: u32,
    /// Identity of this network host; the single source of truth
    pub network_host: String,
    /// Bus topic prefix for network hosts
    pub network_topic: String,
    /// Interval between periodic task ticks
    pub periodic_interval: Duration,
    /// Skip the bus and run rpc targets in-process
    pub fake_call: bool,
    /// Skip driver dhcp/ra side effects
    pub fake_network: bool,
    /// Allocate and associate a floating ip with every instance
    pub auto_assign_floating_ip: bool,
    /// Per-project floating ip cap enforced by the static quota
    pub floating_ip_quota: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_driver: "linux".to_string(),
            flat_network_bridge: "br100".to_string(),
            flat_network_dns: Ipv4Addr::new(8, 8, 4, 4),
            flat_injected: true,
            flat_interface: None,
            flat_network_dhcp_start: Ipv4Addr::new(10, 0, 0, 2),
            vlan_start: 100,
            vlan_interface: None,
            num_networks: 1,
            network_size: 256,
            vpn_ip: None,
            vpn_start: 1000,
            cnt_vpn_clients: 0,
            floating_range: "4.4.4.0/24".parse().unwrap(),
            fixed_range: "10.0.0.0/8".parse().unwrap(),
            fixed_range_v6: "fd00::/48".parse().unwrap(),
            gateway_v6: None,
            use_ipv6: false,
            update_dhcp_on_disassociate: false,
            fixed_ip_disassociate_timeout: Duration::from_secs(600),
            create_unique_mac_address_attempts: 5,
            network_host: "localhost".to_string(),
            network_topic: "network".to_string(),
            periodic_interval: Duration::from_secs(10),
            fake_call: false,
            fake_network: false,
            auto_assign_floating_ip: false,
            floating_ip_quota: 10,
        }
    }
}

impl NetworkConfig {
    /// A config for the named host with everything else defaulted
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            network_host: host.into(),
            ..Self::default()
        }
    }
}
