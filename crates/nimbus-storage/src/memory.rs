use crate::error::{Result, StorageError};
use crate::store::{FixedIpUpdate, NetworkUpdate, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_core::{
    FixedIp, FloatingIp, InstanceId, InstanceType, Network, NetworkId, VirtualInterface,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    networks: BTreeMap<NetworkId, Network>,
    /// Keyed by address; iteration order is pool order
    fixed_ips: BTreeMap<Ipv4Addr, FixedIp>,
    vifs: BTreeMap<u64, VirtualInterface>,
    floating_ips: BTreeMap<Ipv4Addr, FloatingIp>,
    instance_types: BTreeMap<u64, InstanceType>,
    host_ips: HashMap<String, Ipv4Addr>,
    next_id: u64,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store for tests and single-process deployments.
///
/// All tables live behind one `RwLock`; holding the write guard for the
/// duration of a claim is what makes `fixed_ip_associate_pool` and
/// `network_set_host` atomic.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Record the address this host uses on multi-host networks
    pub async fn register_host_ip(&self, host: impl Into<String>, ip: Ipv4Addr) {
        let mut tables = self.tables.write().await;
        tables.host_ips.insert(host.into(), ip);
    }

    /// Seed an instance flavor
    pub async fn instance_type_create(&self, name: impl Into<String>, rxtx_cap: u32) -> InstanceType {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let flavor = InstanceType {
            id,
            name: name.into(),
            rxtx_cap,
        };
        tables.instance_types.insert(id, flavor.clone());
        flavor
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn network_create_safe(&self, mut network: Network) -> Result<Option<Network>> {
        let mut tables = self.tables.write().await;
        let overlaps = tables.networks.values().any(|existing| {
            existing.cidr.contains(&network.cidr) || network.cidr.contains(&existing.cidr)
        });
        if overlaps {
            return Ok(None);
        }
        network.id = tables.next_id();
        tables.networks.insert(network.id, network.clone());
        debug!("network created: {} ({})", network.label, network.cidr);
        Ok(Some(network))
    }

    async fn network_get(&self, id: NetworkId) -> Result<Network> {
        let tables = self.tables.read().await;
        tables
            .networks
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("network", id.to_string()))
    }

    async fn network_get_all(&self) -> Result<Vec<Network>> {
        let tables = self.tables.read().await;
        Ok(tables.networks.values().cloned().collect())
    }

    async fn network_get_all_by_host(&self, host: &str) -> Result<Vec<Network>> {
        let tables = self.tables.read().await;
        Ok(tables
            .networks
            .values()
            .filter(|n| n.host.as_deref() == Some(host))
            .cloned()
            .collect())
    }

    async fn network_get_all_by_instance(&self, instance_id: InstanceId) -> Result<Vec<Network>> {
        let tables = self.tables.read().await;
        let network_ids: HashSet<NetworkId> = tables
            .vifs
            .values()
            .filter(|vif| vif.instance_id == instance_id)
            .map(|vif| vif.network_id)
            .collect();
        Ok(tables
            .networks
            .values()
            .filter(|n| network_ids.contains(&n.id))
            .cloned()
            .collect())
    }

    async fn network_set_host(&self, id: NetworkId, host: &str) -> Result<String> {
        let mut tables = self.tables.write().await;
        let network = tables
            .networks
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("network", id.to_string()))?;
        match &network.host {
            Some(existing) => Ok(existing.clone()),
            None => {
                network.host = Some(host.to_string());
                Ok(host.to_string())
            }
        }
    }

    async fn network_update(&self, id: NetworkId, update: NetworkUpdate) -> Result<()> {
        let mut tables = self.tables.write().await;
        let network = tables
            .networks
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("network", id.to_string()))?;
        if let Some(injected) = update.injected {
            network.injected = injected;
        }
        if let Some(dns) = update.dns {
            network.dns = Some(dns);
        }
        if let Some(dhcp_start) = update.dhcp_start {
            network.dhcp_start = dhcp_start;
        }
        if let Some(gateway_v6) = update.gateway_v6 {
            network.gateway_v6 = Some(gateway_v6);
        }
        if let Some(vpn_public_address) = update.vpn_public_address {
            network.vpn_public_address = Some(vpn_public_address);
        }
        Ok(())
    }

    async fn network_get_host_ip(&self, host: &str) -> Result<Ipv4Addr> {
        let tables = self.tables.read().await;
        tables
            .host_ips
            .get(host)
            .copied()
            .ok_or_else(|| StorageError::not_found("host ip", host))
    }

    async fn project_get_networks(&self, project_id: &str) -> Result<Vec<Network>> {
        let tables = self.tables.read().await;
        Ok(tables
            .networks
            .values()
            .filter(|n| n.project_id.as_deref() == Some(project_id))
            .cloned()
            .collect())
    }

    async fn network_associate(&self, project_id: &str, force: bool) -> Result<Network> {
        let mut tables = self.tables.write().await;
        if !force {
            if let Some(existing) = tables
                .networks
                .values()
                .find(|n| n.project_id.as_deref() == Some(project_id))
            {
                return Ok(existing.clone());
            }
        }
        let id = tables
            .networks
            .values()
            .find(|n| n.project_id.is_none() && n.vlan.is_some())
            .map(|n| n.id)
            .ok_or_else(|| StorageError::not_found("unassociated network", project_id))?;
        let network = tables
            .networks
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("network", id.to_string()))?;
        network.project_id = Some(project_id.to_string());
        Ok(network.clone())
    }

    async fn fixed_ip_create(&self, mut fixed_ip: FixedIp) -> Result<FixedIp> {
        let mut tables = self.tables.write().await;
        fixed_ip.id = tables.next_id();
        tables.fixed_ips.insert(fixed_ip.address, fixed_ip.clone());
        Ok(fixed_ip)
    }

    async fn fixed_ip_associate_pool(
        &self,
        network_id: NetworkId,
        instance_id: InstanceId,
    ) -> Result<Ipv4Addr> {
        let mut tables = self.tables.write().await;
        let address = tables
            .fixed_ips
            .values()
            .find(|ip| ip.network_id == network_id && !ip.reserved && ip.instance_id.is_none())
            .map(|ip| ip.address)
            .ok_or(StorageError::PoolExhausted { network_id })?;
        let fixed_ip = tables
            .fixed_ips
            .get_mut(&address)
            .ok_or_else(|| StorageError::not_found("fixed ip", address.to_string()))?;
        fixed_ip.instance_id = Some(instance_id);
        fixed_ip.updated_at = Utc::now();
        Ok(address)
    }

    async fn fixed_ip_associate(&self, address: Ipv4Addr, instance_id: InstanceId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let fixed_ip = tables
            .fixed_ips
            .get_mut(&address)
            .ok_or_else(|| StorageError::not_found("fixed ip", address.to_string()))?;
        if fixed_ip.instance_id.is_some() && fixed_ip.instance_id != Some(instance_id) {
            return Err(StorageError::AddressInUse { address });
        }
        fixed_ip.instance_id = Some(instance_id);
        fixed_ip.updated_at = Utc::now();
        Ok(())
    }

    async fn fixed_ip_disassociate(&self, address: Ipv4Addr) -> Result<Network> {
        let mut tables = self.tables.write().await;
        let network_id = {
            let fixed_ip = tables
                .fixed_ips
                .get_mut(&address)
                .ok_or_else(|| StorageError::not_found("fixed ip", address.to_string()))?;
            fixed_ip.instance_id = None;
            fixed_ip.updated_at = Utc::now();
            fixed_ip.network_id
        };
        tables
            .networks
            .get(&network_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("network", network_id.to_string()))
    }

    async fn fixed_ip_disassociate_all_by_timeout(
        &self,
        host: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let host_networks: HashSet<NetworkId> = tables
            .networks
            .values()
            .filter(|n| n.host.as_deref() == Some(host))
            .map(|n| n.id)
            .collect();
        let mut count = 0;
        for fixed_ip in tables.fixed_ips.values_mut() {
            if fixed_ip.instance_id.is_some()
                && !fixed_ip.allocated
                && !fixed_ip.leased
                && fixed_ip.updated_at < cutoff
                && host_networks.contains(&fixed_ip.network_id)
            {
                fixed_ip.instance_id = None;
                fixed_ip.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn fixed_ip_update(&self, address: Ipv4Addr, update: FixedIpUpdate) -> Result<()> {
        let mut tables = self.tables.write().await;
        let fixed_ip = tables
            .fixed_ips
            .get_mut(&address)
            .ok_or_else(|| StorageError::not_found("fixed ip", address.to_string()))?;
        if let Some(allocated) = update.allocated {
            fixed_ip.allocated = allocated;
        }
        if let Some(vif_id) = update.virtual_interface_id {
            fixed_ip.virtual_interface_id = vif_id;
        }
        if let Some(leased) = update.leased {
            fixed_ip.leased = leased;
        }
        fixed_ip.updated_at = update.updated_at.unwrap_or_else(Utc::now);
        Ok(())
    }

    async fn fixed_ip_get_by_address(&self, address: Ipv4Addr) -> Result<FixedIp> {
        let tables = self.tables.read().await;
        tables
            .fixed_ips
            .get(&address)
            .cloned()
            .ok_or_else(|| StorageError::not_found("fixed ip", address.to_string()))
    }

    async fn fixed_ip_get_by_id(&self, id: u64) -> Result<FixedIp> {
        let tables = self.tables.read().await;
        tables
            .fixed_ips
            .values()
            .find(|ip| ip.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("fixed ip", id.to_string()))
    }

    async fn fixed_ip_get_by_instance(&self, instance_id: InstanceId) -> Result<Vec<FixedIp>> {
        let tables = self.tables.read().await;
        Ok(tables
            .fixed_ips
            .values()
            .filter(|ip| ip.instance_id == Some(instance_id))
            .cloned()
            .collect())
    }

    async fn fixed_ip_get_network(&self, address: Ipv4Addr) -> Result<Network> {
        let tables = self.tables.read().await;
        let fixed_ip = tables
            .fixed_ips
            .get(&address)
            .ok_or_else(|| StorageError::not_found("fixed ip", address.to_string()))?;
        tables
            .networks
            .get(&fixed_ip.network_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("network", fixed_ip.network_id.to_string()))
    }

    async fn virtual_interface_create(&self, mut vif: VirtualInterface) -> Result<VirtualInterface> {
        let mut tables = self.tables.write().await;
        if tables.vifs.values().any(|v| v.mac == vif.mac) {
            return Err(StorageError::mac_conflict(vif.mac));
        }
        vif.id = tables.next_id();
        tables.vifs.insert(vif.id, vif.clone());
        Ok(vif)
    }

    async fn virtual_interface_get_by_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<VirtualInterface>> {
        let tables = self.tables.read().await;
        Ok(tables
            .vifs
            .values()
            .filter(|vif| vif.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn virtual_interface_get_by_instance_and_network(
        &self,
        instance_id: InstanceId,
        network_id: NetworkId,
    ) -> Result<VirtualInterface> {
        let tables = self.tables.read().await;
        tables
            .vifs
            .values()
            .find(|vif| vif.instance_id == instance_id && vif.network_id == network_id)
            .cloned()
            .ok_or_else(|| {
                StorageError::not_found(
                    "virtual interface",
                    format!("instance {} network {}", instance_id, network_id),
                )
            })
    }

    async fn virtual_interface_delete_by_instance(&self, instance_id: InstanceId) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.vifs.retain(|_, vif| vif.instance_id != instance_id);
        Ok(())
    }

    async fn floating_ip_create(&self, address: Ipv4Addr) -> Result<FloatingIp> {
        let mut tables = self.tables.write().await;
        if tables.floating_ips.contains_key(&address) {
            return Err(StorageError::AddressInUse { address });
        }
        let id = tables.next_id();
        let floating = FloatingIp {
            id,
            address,
            project_id: None,
            fixed_ip_id: None,
            host: None,
            auto_assigned: false,
        };
        tables.floating_ips.insert(address, floating.clone());
        Ok(floating)
    }

    async fn floating_ip_allocate_address(&self, project_id: &str) -> Result<Ipv4Addr> {
        let mut tables = self.tables.write().await;
        let address = tables
            .floating_ips
            .values()
            .find(|ip| ip.project_id.is_none())
            .map(|ip| ip.address)
            .ok_or(StorageError::FloatingPoolExhausted)?;
        let floating = tables
            .floating_ips
            .get_mut(&address)
            .ok_or_else(|| StorageError::not_found("floating ip", address.to_string()))?;
        floating.project_id = Some(project_id.to_string());
        Ok(address)
    }

    async fn floating_ip_deallocate(&self, address: Ipv4Addr) -> Result<()> {
        let mut tables = self.tables.write().await;
        let floating = tables
            .floating_ips
            .get_mut(&address)
            .ok_or_else(|| StorageError::not_found("floating ip", address.to_string()))?;
        if floating.fixed_ip_id.is_some() {
            return Err(StorageError::StillAssociated { address });
        }
        floating.project_id = None;
        floating.auto_assigned = false;
        Ok(())
    }

    async fn floating_ip_fixed_ip_associate(
        &self,
        floating_address: Ipv4Addr,
        fixed_address: Ipv4Addr,
        host: &str,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let fixed_id = tables
            .fixed_ips
            .get(&fixed_address)
            .map(|ip| ip.id)
            .ok_or_else(|| StorageError::not_found("fixed ip", fixed_address.to_string()))?;
        let floating = tables
            .floating_ips
            .get_mut(&floating_address)
            .ok_or_else(|| StorageError::not_found("floating ip", floating_address.to_string()))?;
        if floating.fixed_ip_id.is_some() {
            return Err(StorageError::AlreadyAssociated {
                address: floating_address,
            });
        }
        floating.fixed_ip_id = Some(fixed_id);
        floating.host = Some(host.to_string());
        Ok(())
    }

    async fn floating_ip_disassociate(
        &self,
        floating_address: Ipv4Addr,
    ) -> Result<Option<Ipv4Addr>> {
        let mut tables = self.tables.write().await;
        let fixed_id = {
            let floating = tables
                .floating_ips
                .get_mut(&floating_address)
                .ok_or_else(|| {
                    StorageError::not_found("floating ip", floating_address.to_string())
                })?;
            let fixed_id = floating.fixed_ip_id.take();
            floating.host = None;
            fixed_id
        };
        Ok(fixed_id.and_then(|id| {
            tables
                .fixed_ips
                .values()
                .find(|ip| ip.id == id)
                .map(|ip| ip.address)
        }))
    }

    async fn floating_ip_get_by_address(&self, address: Ipv4Addr) -> Result<FloatingIp> {
        let tables = self.tables.read().await;
        tables
            .floating_ips
            .get(&address)
            .cloned()
            .ok_or_else(|| StorageError::not_found("floating ip", address.to_string()))
    }

    async fn floating_ip_get_all_by_host(&self, host: &str) -> Result<Vec<FloatingIp>> {
        let tables = self.tables.read().await;
        Ok(tables
            .floating_ips
            .values()
            .filter(|ip| ip.host.as_deref() == Some(host))
            .cloned()
            .collect())
    }

    async fn floating_ip_get_by_fixed(&self, fixed_address: Ipv4Addr) -> Result<Vec<FloatingIp>> {
        let tables = self.tables.read().await;
        let fixed_id = match tables.fixed_ips.get(&fixed_address) {
            Some(ip) => ip.id,
            None => return Ok(vec![]),
        };
        Ok(tables
            .floating_ips
            .values()
            .filter(|ip| ip.fixed_ip_id == Some(fixed_id))
            .cloned()
            .collect())
    }

    async fn floating_ip_set_auto_assigned(&self, address: Ipv4Addr) -> Result<()> {
        let mut tables = self.tables.write().await;
        let floating = tables
            .floating_ips
            .get_mut(&address)
            .ok_or_else(|| StorageError::not_found("floating ip", address.to_string()))?;
        floating.auto_assigned = true;
        Ok(())
    }

    async fn floating_ip_count_by_project(&self, project_id: &str) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables
            .floating_ips
            .values()
            .filter(|ip| ip.project_id.as_deref() == Some(project_id))
            .count())
    }

    async fn instance_type_get_by_id(&self, id: u64) -> Result<InstanceType> {
        let tables = self.tables.read().await;
        tables
            .instance_types
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("instance type", id.to_string()))
    }

    async fn queue_get_for(&self, topic: &str, host: &str) -> Result<String> {
        Ok(format!("{}.{}", topic, host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn test_network(cidr: &str) -> Network {
        let cidr: ipnet::Ipv4Net = cidr.parse().unwrap();
        Network {
            id: 0,
            label: "test".to_string(),
            cidr,
            cidr_v6: None,
            netmask: cidr.netmask(),
            netmask_v6: None,
            gateway: Ipv4Addr::from(u32::from(cidr.network()) + 1),
            gateway_v6: None,
            broadcast: cidr.broadcast(),
            bridge: "br100".to_string(),
            bridge_interface: None,
            vlan: None,
            vpn_public_address: None,
            vpn_public_port: None,
            vpn_private_address: None,
            dns: None,
            dhcp_start: Ipv4Addr::from(u32::from(cidr.network()) + 2),
            injected: false,
            multi_host: false,
            host: None,
            project_id: None,
        }
    }

    async fn seed_network(store: &MemoryStore, cidr: &str) -> Network {
        store
            .network_create_safe(test_network(cidr))
            .await
            .unwrap()
            .expect("no cidr conflict")
    }

    async fn seed_fixed_ip(store: &MemoryStore, network_id: u64, address: &str, reserved: bool) {
        store
            .fixed_ip_create(FixedIp::unassociated(
                network_id,
                address.parse().unwrap(),
                reserved,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_network_create_safe_rejects_overlap() {
        let store = MemoryStore::new();
        seed_network(&store, "10.0.0.0/24").await;

        // identical and contained blocks both conflict
        let dup = store
            .network_create_safe(test_network("10.0.0.0/24"))
            .await
            .unwrap();
        assert!(dup.is_none());
        let contained = store
            .network_create_safe(test_network("10.0.0.0/25"))
            .await
            .unwrap();
        assert!(contained.is_none());

        let disjoint = store
            .network_create_safe(test_network("10.0.1.0/24"))
            .await
            .unwrap();
        assert!(disjoint.is_some());
    }

    #[tokio::test]
    async fn test_pool_claim_skips_reserved_in_pool_order() {
        let store = MemoryStore::new();
        let network = seed_network(&store, "10.0.0.0/29").await;
        seed_fixed_ip(&store, network.id, "10.0.0.0", true).await;
        seed_fixed_ip(&store, network.id, "10.0.0.1", true).await;
        seed_fixed_ip(&store, network.id, "10.0.0.2", false).await;
        seed_fixed_ip(&store, network.id, "10.0.0.3", false).await;

        let instance = Uuid::new_v4();
        let first = store
            .fixed_ip_associate_pool(network.id, instance)
            .await
            .unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 0, 0, 2));
        let second = store
            .fixed_ip_associate_pool(network.id, instance)
            .await
            .unwrap();
        assert_eq!(second, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[tokio::test]
    async fn test_pool_claim_last_address_single_winner() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let network = seed_network(&store, "10.0.0.0/29").await;
        seed_fixed_ip(&store, network.id, "10.0.0.2", false).await;

        let a = store.fixed_ip_associate_pool(network.id, Uuid::new_v4());
        let b = store.fixed_ip_associate_pool(network.id, Uuid::new_v4());
        let (ra, rb) = tokio::join!(a, b);

        let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let loser = if ra.is_err() { ra } else { rb };
        assert!(matches!(
            loser.unwrap_err(),
            StorageError::PoolExhausted { .. }
        ));
    }

    #[tokio::test]
    async fn test_network_set_host_first_writer_wins() {
        let store = MemoryStore::new();
        let network = seed_network(&store, "10.0.0.0/24").await;

        let winner = store.network_set_host(network.id, "host-a").await.unwrap();
        assert_eq!(winner, "host-a");
        let second = store.network_set_host(network.id, "host-b").await.unwrap();
        assert_eq!(second, "host-a");
    }

    #[tokio::test]
    async fn test_virtual_interface_mac_conflict() {
        let store = MemoryStore::new();
        let network = seed_network(&store, "10.0.0.0/24").await;
        let vif = VirtualInterface {
            id: 0,
            mac: "02:16:3e:aa:bb:cc".to_string(),
            instance_id: Uuid::new_v4(),
            network_id: network.id,
        };
        store.virtual_interface_create(vif.clone()).await.unwrap();

        let err = store
            .virtual_interface_create(VirtualInterface {
                instance_id: Uuid::new_v4(),
                ..vif
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MacConflict { .. }));
    }

    #[tokio::test]
    async fn test_disassociate_all_by_timeout_scoped_to_host() {
        let store = MemoryStore::new();
        let mine = seed_network(&store, "10.0.0.0/24").await;
        let theirs = seed_network(&store, "10.0.1.0/24").await;
        store.network_set_host(mine.id, "host-a").await.unwrap();
        store.network_set_host(theirs.id, "host-b").await.unwrap();
        seed_fixed_ip(&store, mine.id, "10.0.0.2", false).await;
        seed_fixed_ip(&store, theirs.id, "10.0.1.2", false).await;

        let instance = Uuid::new_v4();
        store
            .fixed_ip_associate("10.0.0.2".parse().unwrap(), instance)
            .await
            .unwrap();
        store
            .fixed_ip_associate("10.0.1.2".parse().unwrap(), instance)
            .await
            .unwrap();
        // age both rows past the cutoff
        let old = Utc::now() - ChronoDuration::seconds(3600);
        for address in ["10.0.0.2", "10.0.1.2"] {
            store
                .fixed_ip_update(
                    address.parse().unwrap(),
                    FixedIpUpdate {
                        updated_at: Some(old),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let cutoff = Utc::now() - ChronoDuration::seconds(600);
        let count = store
            .fixed_ip_disassociate_all_by_timeout("host-a", cutoff)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let cleared = store
            .fixed_ip_get_by_address("10.0.0.2".parse().unwrap())
            .await
            .unwrap();
        assert!(cleared.instance_id.is_none());
        let kept = store
            .fixed_ip_get_by_address("10.0.1.2".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(kept.instance_id, Some(instance));
    }

    #[tokio::test]
    async fn test_disassociate_all_by_timeout_spares_recent_and_leased() {
        let store = MemoryStore::new();
        let network = seed_network(&store, "10.0.0.0/24").await;
        store.network_set_host(network.id, "host-a").await.unwrap();
        seed_fixed_ip(&store, network.id, "10.0.0.2", false).await;
        store
            .fixed_ip_associate("10.0.0.2".parse().unwrap(), Uuid::new_v4())
            .await
            .unwrap();

        // fresh row is untouched
        let cutoff = Utc::now() - ChronoDuration::seconds(600);
        let count = store
            .fixed_ip_disassociate_all_by_timeout("host-a", cutoff)
            .await
            .unwrap();
        assert_eq!(count, 0);

        // an old but still-leased row is untouched too
        let old = Utc::now() - ChronoDuration::seconds(3600);
        store
            .fixed_ip_update(
                "10.0.0.2".parse().unwrap(),
                FixedIpUpdate {
                    leased: Some(true),
                    updated_at: Some(old),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let count = store
            .fixed_ip_disassociate_all_by_timeout("host-a", cutoff)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_floating_ip_pool_and_association() {
        let store = MemoryStore::new();
        let network = seed_network(&store, "10.0.0.0/24").await;
        seed_fixed_ip(&store, network.id, "10.0.0.2", false).await;
        store
            .floating_ip_create("4.4.4.10".parse().unwrap())
            .await
            .unwrap();

        let address = store.floating_ip_allocate_address("proj").await.unwrap();
        assert_eq!(address, Ipv4Addr::new(4, 4, 4, 10));
        assert_eq!(store.floating_ip_count_by_project("proj").await.unwrap(), 1);
        assert!(matches!(
            store.floating_ip_allocate_address("other").await,
            Err(StorageError::FloatingPoolExhausted)
        ));

        store
            .floating_ip_fixed_ip_associate(address, "10.0.0.2".parse().unwrap(), "host-a")
            .await
            .unwrap();
        // second association and pool return are both rejected
        assert!(matches!(
            store
                .floating_ip_fixed_ip_associate(address, "10.0.0.2".parse().unwrap(), "host-a")
                .await,
            Err(StorageError::AlreadyAssociated { .. })
        ));
        assert!(matches!(
            store.floating_ip_deallocate(address).await,
            Err(StorageError::StillAssociated { .. })
        ));

        let fixed = store.floating_ip_disassociate(address).await.unwrap();
        assert_eq!(fixed, Some("10.0.0.2".parse().unwrap()));
        // disassociate is idempotent
        let again = store.floating_ip_disassociate(address).await.unwrap();
        assert_eq!(again, None);

        store.floating_ip_deallocate(address).await.unwrap();
        let row = store.floating_ip_get_by_address(address).await.unwrap();
        assert!(row.project_id.is_none());
        assert!(!row.auto_assigned);
    }

    #[tokio::test]
    async fn test_queue_get_for_format() {
        let store = MemoryStore::new();
        let queue = store.queue_get_for("network", "host-a").await.unwrap();
        assert_eq!(queue, "network.host-a");
    }

    #[tokio::test]
    async fn test_network_associate_claims_vlan_network_once() {
        let store = MemoryStore::new();
        let mut vlan_net = test_network("10.0.0.0/24");
        vlan_net.vlan = Some(100);
        let created = store
            .network_create_safe(vlan_net)
            .await
            .unwrap()
            .expect("created");

        let claimed = store.network_associate("proj", false).await.unwrap();
        assert_eq!(claimed.id, created.id);
        assert_eq!(claimed.project_id.as_deref(), Some("proj"));

        // without force the project keeps its existing network
        let again = store.network_associate("proj", false).await.unwrap();
        assert_eq!(again.id, created.id);
        // with force there is nothing left to claim
        assert!(store.network_associate("proj", true).await.is_err());
    }
}
