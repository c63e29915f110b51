pub mod flat;
pub mod flat_dhcp;
pub mod vlan;

pub use flat::FlatPolicy;
pub use flat_dhcp::FlatDhcpPolicy;
pub use vlan::VlanPolicy;

use crate::error::Result;
use crate::host::{CreateNetworksSpec, HostContext};
use async_trait::async_trait;
use nimbus_core::{InstanceId, Network, NetworkConfig};
use std::str::FromStr;
use std::sync::Arc;

/// Reserved addresses at the edges of every subnet a policy creates.
///
/// Computed once at policy construction: the base layout keeps the
/// network address and gateway at the bottom and the broadcast at the
/// top; VLAN adds the vpn endpoint below and the vpn client slots above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedSlots {
    pub bottom: usize,
    pub top: usize,
}

impl ReservedSlots {
    /// network address, gateway / broadcast
    pub fn base() -> Self {
        Self { bottom: 2, top: 1 }
    }

    /// base + vpn private address / vpn client slots
    pub fn vlan(cnt_vpn_clients: usize) -> Self {
        let base = Self::base();
        Self {
            bottom: base.bottom + 1,
            top: base.top + cnt_vpn_clients,
        }
    }

    pub fn total(&self) -> usize {
        self.bottom + self.top
    }
}

/// A network topology variant.
///
/// Policies differ only in which networks an instance joins, how fixed
/// ip acquisition interacts with dhcp, and bridge/vlan ensure; the
/// capability flags drive which structs the host composes around the
/// policy.
#[async_trait]
pub trait TopologyPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn reserved_slots(&self) -> ReservedSlots;

    /// Whether stale leases on this host's networks are reclaimed
    fn timeout_fixed_ips(&self) -> bool;

    /// Whether the host runs dhcp: allocation refreshes the daemon and
    /// deallocation leaves the instance association to lease grace
    fn manages_dhcp(&self) -> bool;

    /// Whether fixed ip allocation fans out to owning hosts over rpc
    fn uses_rpc_fanout(&self) -> bool;

    fn supports_floating(&self) -> bool;

    /// Whether networks are created with vpn endpoints and vlan tags
    fn vpn_mode(&self) -> bool;

    /// Variant-specific create_networks preconditions
    fn validate_create(&self, spec: &CreateNetworksSpec) -> Result<()>;

    /// Which networks an instance should connect to
    async fn networks_for_instance(
        &self,
        cx: &HostContext,
        instance_id: InstanceId,
        project_id: &str,
    ) -> Result<Vec<Network>>;

    /// Called when this host becomes the host for a network; must be
    /// idempotent
    async fn on_become_host(&self, cx: &HostContext, network: &Network) -> Result<()>;

    /// Compute-host-side bridge/vlan setup for an instance's networks
    async fn setup_compute_network(&self, cx: &HostContext, instance_id: InstanceId) -> Result<()>;
}

/// Topology variant selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Flat,
    FlatDhcp,
    Vlan,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Flat => "flat",
            PolicyKind::FlatDhcp => "flat-dhcp",
            PolicyKind::Vlan => "vlan",
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "flat" => Ok(PolicyKind::Flat),
            "flat-dhcp" | "flatdhcp" => Ok(PolicyKind::FlatDhcp),
            "vlan" => Ok(PolicyKind::Vlan),
            other => Err(format!(
                "unknown policy '{}', expected flat, flat-dhcp or vlan",
                other
            )),
        }
    }
}

/// Construct the policy for a variant, sizing its reserved slots from
/// the configuration
pub fn policy_for(kind: PolicyKind, config: &NetworkConfig) -> Arc<dyn TopologyPolicy> {
    match kind {
        PolicyKind::Flat => Arc::new(FlatPolicy::new()),
        PolicyKind::FlatDhcp => Arc::new(FlatDhcpPolicy::new()),
        PolicyKind::Vlan => Arc::new(VlanPolicy::new(config.cnt_vpn_clients)),
    }
}
