use crate::bus::{Bus, InProcessBus, RpcRequest};
use crate::cidr;
use crate::dhcp;
use crate::driver::NetworkDriver;
use crate::error::{NetworkError, Result};
use crate::fanout::RpcFanout;
use crate::floating::FloatingIpOps;
use crate::ipv6;
use crate::mac;
use crate::policy::TopologyPolicy;
use crate::quota::Quota;
use chrono::Utc;
use futures_util::future::{join_all, BoxFuture};
use ipnet::{Ipv4Net, Ipv6Net};
use nimbus_core::{
    FixedIp, InstanceId, InterfaceInfo, Ip6Entry, IpEntry, Network, NetworkConfig,
    NetworkDescriptor, NetworkId, NetworkInfo, ProjectId, VirtualInterface,
};
use nimbus_storage::{FixedIpUpdate, StorageError, Store};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared collaborators a host and its policy operate through
pub struct HostContext {
    pub store: Arc<dyn Store>,
    pub driver: Arc<dyn NetworkDriver>,
    pub config: NetworkConfig,
    /// This service's host id; the single source of truth for ownership
    /// comparisons and dhcp-listen lookups
    pub host: String,
}

/// Parameters for carving networks out of a parent block
#[derive(Debug, Clone)]
pub struct CreateNetworksSpec {
    pub label: String,
    pub cidr: Ipv4Net,
    pub num_networks: u32,
    pub network_size: u32,
    pub cidr_v6: Option<Ipv6Net>,
    pub gateway_v6: Option<Ipv6Addr>,
    pub bridge: String,
    pub bridge_interface: Option<String>,
    pub multi_host: bool,
    pub dns: Option<Ipv4Addr>,
    pub vlan_start: Option<u16>,
    pub vpn_start: Option<u16>,
}

impl CreateNetworksSpec {
    pub fn new(label: impl Into<String>, cidr: Ipv4Net, num_networks: u32, network_size: u32) -> Self {
        Self {
            label: label.into(),
            cidr,
            num_networks,
            network_size,
            cidr_v6: None,
            gateway_v6: None,
            bridge: "br100".to_string(),
            bridge_interface: None,
            multi_host: false,
            dns: None,
            vlan_start: None,
            vpn_start: None,
        }
    }
}

/// An instance's network allocation request
#[derive(Debug, Clone)]
pub struct AllocateRequest {
    pub instance_id: InstanceId,
    /// Compute host the instance runs on
    pub host: String,
    pub project_id: ProjectId,
    pub instance_type_id: u64,
    /// Bind the network's vpn endpoint instead of a pool address
    pub vpn: bool,
}

impl AllocateRequest {
    pub fn new(
        instance_id: InstanceId,
        host: impl Into<String>,
        project_id: impl Into<String>,
        instance_type_id: u64,
    ) -> Self {
        Self {
            instance_id,
            host: host.into(),
            project_id: project_id.into(),
            instance_type_id,
            vpn: false,
        }
    }
}

/// A network host: owns ip lifecycle and topology setup for the
/// networks claimed by this service.
///
/// The topology policy decides which networks an instance joins and how
/// dhcp interacts with allocation; the optional capability structs are
/// composed at construction from what the policy supports.
pub struct NetworkHost {
    cx: HostContext,
    policy: Arc<dyn TopologyPolicy>,
    floating: Option<FloatingIpOps>,
    fanout: Option<RpcFanout>,
    mac_rng: Mutex<StdRng>,
}

impl NetworkHost {
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn NetworkDriver>,
        bus: Arc<dyn Bus>,
        quota: Arc<dyn Quota>,
        policy: Arc<dyn TopologyPolicy>,
        config: NetworkConfig,
    ) -> Self {
        let host = config.network_host.clone();
        let floating = policy.supports_floating().then(|| {
            FloatingIpOps::new(store.clone(), driver.clone(), quota.clone(), host.clone())
        });
        let fanout = policy.uses_rpc_fanout().then(|| {
            RpcFanout::new(
                bus.clone(),
                store.clone(),
                config.network_topic.clone(),
                host.clone(),
                config.fake_call,
            )
        });
        let cx = HostContext {
            store,
            driver,
            config,
            host,
        };
        Self {
            cx,
            policy,
            floating,
            fanout,
            mac_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn host(&self) -> &str {
        &self.cx.host
    }

    pub fn policy(&self) -> &dyn TopologyPolicy {
        self.policy.as_ref()
    }

    /// Floating-ip operations, for policies that carry them
    pub fn floating(&self) -> Option<&FloatingIpOps> {
        self.floating.as_ref()
    }

    #[cfg(test)]
    fn seed_mac_rng(&self, seed: u64) {
        *self.mac_rng.lock().unwrap() = StdRng::seed_from_u64(seed);
    }

    // --- Host lifecycle ---

    /// Configure this host for the networks it already owns.
    ///
    /// DHCP-coupled policies prime the driver and metadata path first,
    /// then every owned network runs its become-host hook, then
    /// floating associations are reconciled.
    pub async fn init_host(&self) -> Result<()> {
        info!(
            "initializing network host '{}' ({} policy)",
            self.cx.host,
            self.policy.name()
        );
        if self.policy.manages_dhcp() {
            self.cx.driver.init_host().await?;
            self.cx.driver.ensure_metadata_ip().await?;
        }
        let networks = self.cx.store.network_get_all_by_host(&self.cx.host).await?;
        for network in &networks {
            self.policy.on_become_host(&self.cx, network).await?;
        }
        if let Some(floating) = &self.floating {
            floating.init_host().await?;
        }
        if self.policy.manages_dhcp() {
            self.cx.driver.metadata_forward().await?;
        }
        Ok(())
    }

    /// Run the periodic task loop until cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "starting periodic tasks for '{}' (interval: {:?})",
            self.cx.host, self.cx.config.periodic_interval
        );
        let mut tick = tokio::time::interval(self.cx.config.periodic_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("network host '{}' shutting down", self.cx.host);
                    return Ok(());
                }
                _ = tick.tick() => {
                    if let Err(e) = self.periodic_tasks().await {
                        error!("periodic tasks failed: {}", e);
                    }
                }
            }
        }
    }

    /// One tick: reclaim stale leases, then pick up at most one
    /// unclaimed network
    pub async fn periodic_tasks(&self) -> Result<()> {
        if self.policy.timeout_fixed_ips() {
            let timeout = chrono::Duration::from_std(self.cx.config.fixed_ip_disassociate_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
            let cutoff = Utc::now() - timeout;
            let count = self
                .cx
                .store
                .fixed_ip_disassociate_all_by_timeout(&self.cx.host, cutoff)
                .await?;
            if count > 0 {
                debug!("disassociated {} stale fixed ip(s)", count);
            }
        }
        self.pickup_unclaimed_network().await?;
        Ok(())
    }

    /// Claim a network for this host and run the become-host hook
    pub async fn set_network_host(&self, network_id: NetworkId) -> Result<Option<Network>> {
        debug!("setting network host for network {}", network_id);
        let winner = self
            .cx
            .store
            .network_set_host(network_id, &self.cx.host)
            .await?;
        if winner != self.cx.host {
            debug!("network {} already claimed by '{}'", network_id, winner);
            return Ok(None);
        }
        let network = self.cx.store.network_get(network_id).await?;
        self.policy.on_become_host(&self.cx, &network).await?;
        Ok(Some(network))
    }

    // one claim per tick keeps startup load across hosts flat
    async fn pickup_unclaimed_network(&self) -> Result<Option<Network>> {
        let networks = self.cx.store.network_get_all().await?;
        for network in networks {
            if network.host.is_none() {
                return self.set_network_host(network.id).await;
            }
        }
        Ok(None)
    }

    // --- Network creation ---

    /// Carve the parent block into subnets and materialize their
    /// fixed-ip pools
    pub async fn create_networks(&self, spec: &CreateNetworksSpec) -> Result<Vec<Network>> {
        // fill configured defaults in before validation sees the spec
        let mut spec = spec.clone();
        let vlan_start = spec.vlan_start.unwrap_or(self.cx.config.vlan_start);
        let vpn_start = spec.vpn_start.unwrap_or(self.cx.config.vpn_start);
        spec.vlan_start = Some(vlan_start);
        spec.vpn_start = Some(vpn_start);

        self.policy.validate_create(&spec)?;
        let subnets = cidr::carve_subnets(spec.cidr, spec.num_networks, spec.network_size)?;

        let mut created = Vec::with_capacity(subnets.len());
        for (index, subnet) in subnets.into_iter().enumerate() {
            let index = index as u32;
            let label = if spec.num_networks > 1 {
                format!("{}_{}", spec.label, index)
            } else {
                spec.label.clone()
            };
            let mut network = Network {
                id: 0,
                label,
                cidr: subnet,
                cidr_v6: None,
                netmask: subnet.netmask(),
                netmask_v6: None,
                gateway: cidr::nth(subnet, 1),
                gateway_v6: None,
                broadcast: subnet.broadcast(),
                bridge: spec.bridge.clone(),
                bridge_interface: spec.bridge_interface.clone(),
                vlan: None,
                vpn_public_address: None,
                vpn_public_port: None,
                vpn_private_address: None,
                dns: spec.dns.or(Some(self.cx.config.flat_network_dns)),
                dhcp_start: cidr::nth(subnet, 2),
                injected: false,
                multi_host: spec.multi_host,
                host: None,
                project_id: None,
            };

            if self.cx.config.use_ipv6 {
                let parent_v6 = spec.cidr_v6.unwrap_or(self.cx.config.fixed_range_v6);
                let subnet_v6 = cidr::subnet_v6(parent_v6, index)?;
                network.cidr_v6 = Some(subnet_v6);
                network.netmask_v6 = Some(subnet_v6.prefix_len());
                network.gateway_v6 = Some(
                    spec.gateway_v6
                        .or(self.cx.config.gateway_v6)
                        .unwrap_or_else(|| Ipv6Addr::from(u128::from(subnet_v6.network()) + 1)),
                );
            }

            if self.policy.vpn_mode() {
                let vlan = vlan_start + index as u16;
                network.dns = None;
                network.vpn_private_address = Some(cidr::nth(subnet, 2));
                network.dhcp_start = cidr::nth(subnet, 3);
                network.vlan = Some(vlan);
                network.bridge = format!("br{}", vlan);
                // ports are unique across the cloud, not per ip
                network.vpn_public_port = Some(vpn_start + index as u16);
            }

            match self.cx.store.network_create_safe(network).await? {
                Some(network) => {
                    self.create_fixed_ips(&network).await?;
                    created.push(network);
                }
                None => return Err(NetworkError::cidr_conflict(subnet.to_string())),
            }
        }
        info!("created {} network(s) under {}", created.len(), spec.cidr);
        Ok(created)
    }

    async fn create_fixed_ips(&self, network: &Network) -> Result<()> {
        let slots = self.policy.reserved_slots();
        let num_ips = cidr::subnet_len(network.cidr);
        for index in 0..num_ips {
            let address = cidr::nth(network.cidr, index);
            let reserved =
                (index as usize) < slots.bottom || ((num_ips - index) as usize) <= slots.top;
            self.cx
                .store
                .fixed_ip_create(FixedIp::unassociated(network.id, address, reserved))
                .await?;
        }
        Ok(())
    }

    // --- Instance allocation ---

    /// Allocate everything an instance needs: vifs on every target
    /// network, a fixed ip per network (fanned out to owning hosts),
    /// optionally an auto-assigned floating ip, then the assembled
    /// network info
    pub async fn allocate_for_instance(&self, request: &AllocateRequest) -> Result<NetworkInfo> {
        debug!("network allocations for instance {}", request.instance_id);
        let networks = self
            .policy
            .networks_for_instance(&self.cx, request.instance_id, &request.project_id)
            .await?;
        self.allocate_mac_addresses(request.instance_id, &networks)
            .await?;
        self.allocate_fixed_ips(request.instance_id, &request.host, &networks, request.vpn)
            .await?;
        if self.cx.config.auto_assign_floating_ip {
            if let Some(floating) = &self.floating {
                floating
                    .auto_assign(request.instance_id, &request.project_id)
                    .await?;
            }
        }
        self.get_instance_nw_info(request.instance_id, request.instance_type_id)
            .await
    }

    /// Tear down an instance's network resources: floating ips first,
    /// then fixed ips, then vifs
    pub async fn deallocate_for_instance(&self, instance_id: InstanceId) -> Result<()> {
        debug!("network deallocation for instance {}", instance_id);
        if let Some(floating) = &self.floating {
            floating.deallocate_for_instance(instance_id).await?;
        }
        let fixed_ips = self.cx.store.fixed_ip_get_by_instance(instance_id).await?;
        for fixed_ip in &fixed_ips {
            self.deallocate_fixed_ip(fixed_ip.address).await?;
        }
        self.cx
            .store
            .virtual_interface_delete_by_instance(instance_id)
            .await?;
        Ok(())
    }

    /// Allocate one more fixed ip to an instance on a named network
    pub async fn add_fixed_ip_to_instance(
        &self,
        instance_id: InstanceId,
        host: &str,
        network_id: NetworkId,
    ) -> Result<()> {
        let network = self.cx.store.network_get(network_id).await?;
        self.allocate_fixed_ips(instance_id, host, std::slice::from_ref(&network), false)
            .await
    }

    /// Force-associate an unowned network with a project (vlan only)
    pub async fn add_network_to_project(&self, project_id: &str) -> Result<Network> {
        if !self.policy.vpn_mode() {
            return Err(NetworkError::unsupported(
                self.policy.name(),
                "add_network_to_project",
            ));
        }
        Ok(self.cx.store.network_associate(project_id, true).await?)
    }

    /// Compute-host-side bridge/vlan setup for an instance
    pub async fn setup_compute_network(&self, instance_id: InstanceId) -> Result<()> {
        self.policy.setup_compute_network(&self.cx, instance_id).await
    }

    async fn allocate_mac_addresses(
        &self,
        instance_id: InstanceId,
        networks: &[Network],
    ) -> Result<()> {
        for network in networks {
            let attempts = self.cx.config.create_unique_mac_address_attempts;
            let mut created = false;
            for _ in 0..attempts {
                let address = {
                    let mut rng = self.mac_rng.lock().unwrap();
                    mac::generate_mac_address(&mut *rng)
                };
                let vif = VirtualInterface {
                    id: 0,
                    mac: address,
                    instance_id,
                    network_id: network.id,
                };
                match self.cx.store.virtual_interface_create(vif).await {
                    Ok(_) => {
                        created = true;
                        break;
                    }
                    Err(StorageError::MacConflict { mac }) => {
                        debug!("mac {} collided, regenerating", mac);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if !created {
                // roll back every vif this call created for the instance
                self.cx
                    .store
                    .virtual_interface_delete_by_instance(instance_id)
                    .await?;
                return Err(NetworkError::MacExhausted {
                    instance_id,
                    attempts,
                });
            }
        }
        Ok(())
    }

    /// One fixed-ip claim per network: local when this host owns the
    /// network (or on multi-host networks when it is the compute host),
    /// dispatched over the bus otherwise. All claims run concurrently
    /// and the call returns only after every one settles.
    async fn allocate_fixed_ips(
        &self,
        instance_id: InstanceId,
        requested_host: &str,
        networks: &[Network],
        vpn: bool,
    ) -> Result<()> {
        let fanout = match &self.fanout {
            Some(fanout) => fanout,
            None => {
                for network in networks {
                    self.allocate_fixed_ip(instance_id, network, vpn).await?;
                }
                return Ok(());
            }
        };

        let mut claims: Vec<BoxFuture<'_, Result<Ipv4Addr>>> = Vec::with_capacity(networks.len());
        for network in networks {
            let target = fanout.target_host(network, requested_host);
            if fanout.is_remote(&target) {
                claims.push(Box::pin(fanout.call_allocate(
                    target,
                    instance_id,
                    network.id,
                )));
            } else {
                claims.push(Box::pin(self.allocate_fixed_ip(instance_id, network, vpn)));
            }
        }

        let failures: Vec<String> = join_all(claims)
            .await
            .into_iter()
            .filter_map(|result| result.err().map(|e| e.to_string()))
            .collect();
        if !failures.is_empty() {
            return Err(NetworkError::PartialAllocation {
                instance_id,
                failures,
            });
        }
        Ok(())
    }

    /// Claim a fixed ip for an instance on a network and bind it to the
    /// instance's vif there; returns the allocated address
    pub async fn allocate_fixed_ip(
        &self,
        instance_id: InstanceId,
        network: &Network,
        vpn: bool,
    ) -> Result<Ipv4Addr> {
        let address = if vpn {
            if !self.policy.vpn_mode() {
                return Err(NetworkError::unsupported(
                    self.policy.name(),
                    "vpn fixed ip allocation",
                ));
            }
            let address = network.vpn_private_address.ok_or_else(|| {
                NetworkError::invalid_network(
                    format!("network {} has no vpn private address", network.id),
                    "Only networks created in vpn mode carry a vpn endpoint",
                )
            })?;
            self.cx.store.fixed_ip_associate(address, instance_id).await?;
            address
        } else {
            self.cx
                .store
                .fixed_ip_associate_pool(network.id, instance_id)
                .await?
        };

        let vif = self
            .cx
            .store
            .virtual_interface_get_by_instance_and_network(instance_id, network.id)
            .await?;
        self.cx
            .store
            .fixed_ip_update(
                address,
                FixedIpUpdate {
                    allocated: Some(true),
                    virtual_interface_id: Some(Some(vif.id)),
                    ..Default::default()
                },
            )
            .await?;

        if self.policy.manages_dhcp() {
            dhcp::refresh_dhcp(&self.cx, network).await?;
        }
        debug!("allocated fixed ip {} on network {}", address, network.id);
        Ok(address)
    }

    /// Return a fixed ip to the pool. Policies without dhcp drop the
    /// instance association immediately; the rest leave it to lease
    /// release or the stale sweep.
    pub async fn deallocate_fixed_ip(&self, address: Ipv4Addr) -> Result<()> {
        self.cx
            .store
            .fixed_ip_update(
                address,
                FixedIpUpdate {
                    allocated: Some(false),
                    virtual_interface_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        if !self.policy.manages_dhcp() {
            self.cx.store.fixed_ip_disassociate(address).await?;
        }
        Ok(())
    }

    // --- Dhcp daemon callbacks ---

    /// Called by the dhcp bridge when an ip is leased
    pub async fn lease_fixed_ip(&self, address: Ipv4Addr) -> Result<()> {
        debug!("leased ip {}", address);
        let fixed_ip = self.cx.store.fixed_ip_get_by_address(address).await?;
        if fixed_ip.instance_id.is_none() {
            return Err(NetworkError::OrphanLease { address });
        }
        self.cx
            .store
            .fixed_ip_update(
                address,
                FixedIpUpdate {
                    leased: Some(true),
                    updated_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        if !fixed_ip.allocated {
            // the daemon can race deallocation; accept and note it
            warn!("ip {} leased that isn't allocated", address);
        }
        Ok(())
    }

    /// Called by the dhcp bridge when an ip is released
    pub async fn release_fixed_ip(&self, address: Ipv4Addr) -> Result<()> {
        debug!("released ip {}", address);
        let fixed_ip = self.cx.store.fixed_ip_get_by_address(address).await?;
        if fixed_ip.instance_id.is_none() {
            return Err(NetworkError::OrphanLease { address });
        }
        if !fixed_ip.leased {
            warn!("ip {} released that was not leased", address);
        }
        self.cx
            .store
            .fixed_ip_update(
                address,
                FixedIpUpdate {
                    leased: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        if !fixed_ip.allocated {
            let network = self.cx.store.fixed_ip_disassociate(address).await?;
            // drop the stale entry from the conf file right away when
            // the deployment asks for it
            if self.cx.config.update_dhcp_on_disassociate {
                dhcp::refresh_dhcp(&self.cx, &network).await?;
            }
        }
        Ok(())
    }

    // --- Network info assembly ---

    /// Build the `(network, interface)` info pairs for an instance
    pub async fn get_instance_nw_info(
        &self,
        instance_id: InstanceId,
        instance_type_id: u64,
    ) -> Result<NetworkInfo> {
        let fixed_ips = self.cx.store.fixed_ip_get_by_instance(instance_id).await?;
        let vifs = self
            .cx
            .store
            .virtual_interface_get_by_instance(instance_id)
            .await?;
        let flavor = self.cx.store.instance_type_get_by_id(instance_type_id).await?;

        let mut network_info = Vec::with_capacity(vifs.len());
        for vif in vifs {
            let network = self.cx.store.network_get(vif.network_id).await?;
            let ips = fixed_ips
                .iter()
                .filter(|fixed_ip| fixed_ip.network_id == network.id)
                .map(|fixed_ip| IpEntry {
                    ip: fixed_ip.address,
                    netmask: network.netmask,
                    enabled: "1".to_string(),
                })
                .collect();

            let descriptor = NetworkDescriptor {
                id: network.id,
                bridge: network.bridge.clone(),
                cidr: network.cidr,
                cidr_v6: network.cidr_v6,
                injected: network.injected,
            };
            let mut info = InterfaceInfo {
                label: network.label.clone(),
                gateway: network.gateway,
                broadcast: network.broadcast,
                mac: vif.mac.clone(),
                rxtx_cap: flavor.rxtx_cap,
                dns: network.dns.into_iter().collect(),
                ips,
                ip6s: None,
                gateway6: None,
            };
            if let Some(cidr_v6) = network.cidr_v6 {
                let project_id = network.project_id.clone().unwrap_or_default();
                info.ip6s = Some(vec![Ip6Entry {
                    ip: ipv6::to_global(cidr_v6, &vif.mac, &project_id)?,
                    netmask: network.netmask_v6.unwrap_or(64),
                    enabled: "1".to_string(),
                }]);
            }
            if let Some(gateway6) = network.gateway_v6 {
                info.gateway6 = Some(gateway6);
            }
            network_info.push((descriptor, info));
        }
        Ok(network_info)
    }

    // --- Bus surface ---

    /// Serve this host's rpc methods on its network topic
    pub async fn attach_to_bus(self: &Arc<Self>, bus: &InProcessBus) -> Result<()> {
        let queue = self
            .cx
            .store
            .queue_get_for(&self.cx.config.network_topic, &self.cx.host)
            .await?;
        let host = Arc::clone(self);
        bus.register(
            queue,
            Arc::new(move |request: RpcRequest| {
                let host = Arc::clone(&host);
                Box::pin(async move { host.handle_rpc(request).await })
            }),
        );
        Ok(())
    }

    async fn handle_rpc(&self, request: RpcRequest) -> Result<serde_json::Value> {
        match request.method.as_str() {
            "allocate_fixed_ip" => {
                #[derive(Deserialize)]
                struct Args {
                    instance_id: InstanceId,
                    network_id: NetworkId,
                }
                let args: Args = serde_json::from_value(request.args)
                    .map_err(|e| NetworkError::bus(format!("malformed args: {}", e)))?;
                let address = self
                    .rpc_allocate_fixed_ip(args.instance_id, args.network_id)
                    .await?;
                serde_json::to_value(address).map_err(|e| NetworkError::bus(e.to_string()))
            }
            other => Err(NetworkError::bus(format!("unsupported method '{}'", other))),
        }
    }

    /// Far side of the allocation fan-out: look the network up again
    /// and allocate locally
    pub async fn rpc_allocate_fixed_ip(
        &self,
        instance_id: InstanceId,
        network_id: NetworkId,
    ) -> Result<Ipv4Addr> {
        let network = self.cx.store.network_get(network_id).await?;
        self.allocate_fixed_ip(instance_id, &network, false).await
    }
}
