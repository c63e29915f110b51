use crate::dhcp;
use crate::error::{NetworkError, Result};
use crate::host::{CreateNetworksSpec, HostContext};
use crate::policy::{ReservedSlots, TopologyPolicy};
use async_trait::async_trait;
use nimbus_core::{InstanceId, Network};
use nimbus_storage::{NetworkUpdate, Store};

/// Per-project vlan networking with dhcp.
///
/// Each project gets its own vlan, bridge and subnet, with a dhcp
/// server per subnet and a vpn endpoint reserved so the project can
/// reach its instances.
pub struct VlanPolicy {
    reserved: ReservedSlots,
}

impl VlanPolicy {
    pub fn new(cnt_vpn_clients: usize) -> Self {
        Self {
            reserved: ReservedSlots::vlan(cnt_vpn_clients),
        }
    }
}

#[async_trait]
impl TopologyPolicy for VlanPolicy {
    fn name(&self) -> &'static str {
        "vlan"
    }

    fn reserved_slots(&self) -> ReservedSlots {
        self.reserved
    }

    fn timeout_fixed_ips(&self) -> bool {
        true
    }

    fn manages_dhcp(&self) -> bool {
        true
    }

    fn uses_rpc_fanout(&self) -> bool {
        true
    }

    fn supports_floating(&self) -> bool {
        true
    }

    fn vpn_mode(&self) -> bool {
        true
    }

    fn validate_create(&self, spec: &CreateNetworksSpec) -> Result<()> {
        let vlan_start = spec.vlan_start.unwrap_or(0) as u32;
        if spec.num_networks + vlan_start > 4094 {
            return Err(NetworkError::invalid_network(
                format!(
                    "num_networks ({}) + vlan_start ({}) exceeds 4094",
                    spec.num_networks, vlan_start
                ),
                "The vlan id space ends at 4094; lower vlan_start or num_networks",
            ));
        }
        let available = 1u64 << (32 - spec.cidr.prefix_len());
        let needed = spec.num_networks as u64 * spec.network_size as u64;
        if available < needed {
            return Err(NetworkError::invalid_network(
                format!(
                    "network range {} cannot fit {} networks of size {}",
                    spec.cidr, spec.num_networks, spec.network_size
                ),
                "Widen the parent block or request fewer/smaller networks",
            ));
        }
        Ok(())
    }

    async fn networks_for_instance(
        &self,
        cx: &HostContext,
        _instance_id: InstanceId,
        project_id: &str,
    ) -> Result<Vec<Network>> {
        let networks = cx.store.project_get_networks(project_id).await?;
        Ok(networks
            .into_iter()
            .filter(|network| network.host.is_some())
            .collect())
    }

    async fn on_become_host(&self, cx: &HostContext, network: &Network) -> Result<()> {
        let vlan = network.vlan.ok_or_else(|| {
            NetworkError::invalid_network(
                format!("network {} has no vlan tag", network.id),
                "VLAN hosts can only serve networks created in vpn mode",
            )
        })?;

        let vpn_public = match network.vpn_public_address {
            Some(address) => Some(address),
            None => {
                if let Some(address) = cx.config.vpn_ip {
                    cx.store
                        .network_update(
                            network.id,
                            NetworkUpdate {
                                vpn_public_address: Some(address),
                                ..Default::default()
                            },
                        )
                        .await?;
                    Some(address)
                } else {
                    None
                }
            }
        };

        cx.driver
            .ensure_vlan_bridge(
                vlan,
                &network.bridge,
                network.bridge_interface.as_deref(),
                Some(network),
            )
            .await?;

        // only install the forward when the endpoint is ours, not one
        // the operator pointed elsewhere
        if let (Some(address), Some(port), Some(private)) = (
            vpn_public,
            network.vpn_public_port,
            network.vpn_private_address,
        ) {
            if cx.config.vpn_ip == Some(address) {
                cx.driver.ensure_vlan_forward(address, port, private).await?;
            }
        }

        dhcp::refresh_dhcp(cx, network).await?;
        dhcp::refresh_ra(cx, network.id).await?;
        Ok(())
    }

    async fn setup_compute_network(&self, cx: &HostContext, instance_id: InstanceId) -> Result<()> {
        let networks = cx.store.network_get_all_by_instance(instance_id).await?;
        for network in networks {
            if network.multi_host {
                continue;
            }
            let vlan = network.vlan.ok_or_else(|| {
                NetworkError::invalid_network(
                    format!("network {} has no vlan tag", network.id),
                    "VLAN hosts can only serve networks created in vpn mode",
                )
            })?;
            cx.driver
                .ensure_vlan_bridge(
                    vlan,
                    &network.bridge,
                    network.bridge_interface.as_deref(),
                    None,
                )
                .await?;
        }
        Ok(())
    }
}
