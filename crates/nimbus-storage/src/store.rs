use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_core::{
    FixedIp, FloatingIp, InstanceId, InstanceType, Network, NetworkId, VifId, VirtualInterface,
};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Typed patch for a fixed ip row.
///
/// `None` fields are left untouched. `virtual_interface_id` is doubly
/// optional so the patch can clear the binding (`Some(None)`). Unless
/// `updated_at` is pinned, any applied patch refreshes it to now.
#[derive(Debug, Clone, Default)]
pub struct FixedIpUpdate {
    pub allocated: Option<bool>,
    pub virtual_interface_id: Option<Option<VifId>>,
    pub leased: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Typed patch for a network row; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct NetworkUpdate {
    pub injected: Option<bool>,
    pub dns: Option<Ipv4Addr>,
    pub dhcp_start: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
    pub vpn_public_address: Option<Ipv4Addr>,
}

/// The persistence contract the network engine depends on.
///
/// The store is the sole authority for entity state; implementations
/// must make `fixed_ip_associate_pool` and `network_set_host` atomic
/// and enforce a unique index on VIF mac addresses. Everything else is
/// last-writer-wins single-row updates.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Networks ---

    /// Insert a network unless its cidr overlaps an existing one.
    /// The id field of `network` is ignored; returns the stored row,
    /// or None on cidr conflict.
    async fn network_create_safe(&self, network: Network) -> Result<Option<Network>>;

    async fn network_get(&self, id: NetworkId) -> Result<Network>;

    async fn network_get_all(&self) -> Result<Vec<Network>>;

    async fn network_get_all_by_host(&self, host: &str) -> Result<Vec<Network>>;

    /// Networks an instance has virtual interfaces on
    async fn network_get_all_by_instance(&self, instance_id: InstanceId) -> Result<Vec<Network>>;

    /// First-writer-wins host claim; returns the winning host
    async fn network_set_host(&self, id: NetworkId, host: &str) -> Result<String>;

    async fn network_update(&self, id: NetworkId, update: NetworkUpdate) -> Result<()>;

    /// Address this host uses on multi-host networks
    async fn network_get_host_ip(&self, host: &str) -> Result<Ipv4Addr>;

    async fn project_get_networks(&self, project_id: &str) -> Result<Vec<Network>>;

    /// Associate an unowned network with a project; `force` claims one
    /// even if the project already has networks
    async fn network_associate(&self, project_id: &str, force: bool) -> Result<Network>;

    // --- Fixed IPs ---

    /// The id field of `fixed_ip` is ignored; returns the stored row
    async fn fixed_ip_create(&self, fixed_ip: FixedIp) -> Result<FixedIp>;

    /// Atomically claim the lowest free, non-reserved, unassociated
    /// address of a network and bind it to an instance
    async fn fixed_ip_associate_pool(
        &self,
        network_id: NetworkId,
        instance_id: InstanceId,
    ) -> Result<Ipv4Addr>;

    /// Bind a specific address to an instance (vpn endpoints)
    async fn fixed_ip_associate(&self, address: Ipv4Addr, instance_id: InstanceId) -> Result<()>;

    /// Clear the instance binding; returns the owning network
    async fn fixed_ip_disassociate(&self, address: Ipv4Addr) -> Result<Network>;

    /// Disassociate every stale fixed ip on this host's networks older
    /// than the cutoff; returns how many were cleared
    async fn fixed_ip_disassociate_all_by_timeout(
        &self,
        host: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize>;

    async fn fixed_ip_update(&self, address: Ipv4Addr, update: FixedIpUpdate) -> Result<()>;

    async fn fixed_ip_get_by_address(&self, address: Ipv4Addr) -> Result<FixedIp>;

    async fn fixed_ip_get_by_id(&self, id: u64) -> Result<FixedIp>;

    async fn fixed_ip_get_by_instance(&self, instance_id: InstanceId) -> Result<Vec<FixedIp>>;

    async fn fixed_ip_get_network(&self, address: Ipv4Addr) -> Result<Network>;

    // --- Virtual interfaces ---

    /// The id field of `vif` is ignored; fails with `MacConflict` when
    /// the mac is already present
    async fn virtual_interface_create(&self, vif: VirtualInterface) -> Result<VirtualInterface>;

    async fn virtual_interface_get_by_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<VirtualInterface>>;

    async fn virtual_interface_get_by_instance_and_network(
        &self,
        instance_id: InstanceId,
        network_id: NetworkId,
    ) -> Result<VirtualInterface>;

    async fn virtual_interface_delete_by_instance(&self, instance_id: InstanceId) -> Result<()>;

    // --- Floating IPs ---

    /// Seed one floating ip into the deployment pool
    async fn floating_ip_create(&self, address: Ipv4Addr) -> Result<FloatingIp>;

    /// Pop a free floating ip from the pool for a project
    async fn floating_ip_allocate_address(&self, project_id: &str) -> Result<Ipv4Addr>;

    /// Return a floating ip to the pool; fails while still associated
    async fn floating_ip_deallocate(&self, address: Ipv4Addr) -> Result<()>;

    /// Link a floating ip to a fixed ip, recording the serving host;
    /// fails with `AlreadyAssociated` when a link is active
    async fn floating_ip_fixed_ip_associate(
        &self,
        floating_address: Ipv4Addr,
        fixed_address: Ipv4Addr,
        host: &str,
    ) -> Result<()>;

    /// Unlink a floating ip; returns the fixed address it pointed at,
    /// or None when it was not associated
    async fn floating_ip_disassociate(&self, floating_address: Ipv4Addr)
        -> Result<Option<Ipv4Addr>>;

    async fn floating_ip_get_by_address(&self, address: Ipv4Addr) -> Result<FloatingIp>;

    async fn floating_ip_get_all_by_host(&self, host: &str) -> Result<Vec<FloatingIp>>;

    async fn floating_ip_get_by_fixed(&self, fixed_address: Ipv4Addr) -> Result<Vec<FloatingIp>>;

    async fn floating_ip_set_auto_assigned(&self, address: Ipv4Addr) -> Result<()>;

    async fn floating_ip_count_by_project(&self, project_id: &str) -> Result<usize>;

    // --- Misc ---

    async fn instance_type_get_by_id(&self, id: u64) -> Result<InstanceType>;

    /// Queue name for a (topic, host) pair
    async fn queue_get_for(&self, topic: &str, host: &str) -> Result<String>;
}
