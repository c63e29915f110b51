use crate::dhcp;
use crate::error::Result;
use crate::host::{CreateNetworksSpec, HostContext};
use crate::policy::{ReservedSlots, TopologyPolicy};
use async_trait::async_trait;
use nimbus_core::{InstanceId, Network};
use nimbus_storage::{NetworkUpdate, Store};

/// Flat networking with dhcp.
///
/// One dhcp server per network hands out addresses; the host manages
/// the bridge itself and never injects settings into the guest.
/// Otherwise behaves like flat networking.
pub struct FlatDhcpPolicy {
    reserved: ReservedSlots,
}

impl FlatDhcpPolicy {
    pub fn new() -> Self {
        Self {
            reserved: ReservedSlots::base(),
        }
    }
}

impl Default for FlatDhcpPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopologyPolicy for FlatDhcpPolicy {
    fn name(&self) -> &'static str {
        "flat-dhcp"
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
        false
    }

    fn validate_create(&self, _spec: &CreateNetworksSpec) -> Result<()> {
        Ok(())
    }

    async fn networks_for_instance(
        &self,
        cx: &HostContext,
        _instance_id: InstanceId,
        _project_id: &str,
    ) -> Result<Vec<Network>> {
        let networks = cx.store.network_get_all().await?;
        Ok(networks
            .into_iter()
            .filter(|network| network.vlan.is_none() && network.host.is_some())
            .collect())
    }

    async fn on_become_host(&self, cx: &HostContext, network: &Network) -> Result<()> {
        cx.store
            .network_update(
                network.id,
                NetworkUpdate {
                    dhcp_start: Some(cx.config.flat_network_dhcp_start),
                    ..Default::default()
                },
            )
            .await?;
        let network = cx.store.network_get(network.id).await?;
        cx.driver
            .ensure_bridge(
                &network.bridge,
                network.bridge_interface.as_deref(),
                Some(&network),
            )
            .await?;
        dhcp::refresh_dhcp(cx, &network).await?;
        dhcp::refresh_ra(cx, network.id).await?;
        Ok(())
    }

    async fn setup_compute_network(&self, cx: &HostContext, instance_id: InstanceId) -> Result<()> {
        let networks = cx.store.network_get_all_by_instance(instance_id).await?;
        for network in networks {
            if !network.multi_host {
                cx.driver
                    .ensure_bridge(&network.bridge, network.bridge_interface.as_deref(), None)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, MockDriver};
    use crate::host::test_support::{seed_network, test_context};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_on_become_host_ensures_bridge_and_dhcp() {
        let driver = Arc::new(MockDriver::new());
        let cx = test_context(driver.clone(), "host-a").await;
        let network = seed_network(&cx, "10.0.0.0/24", Some("host-a"), None).await;

        let policy = FlatDhcpPolicy::new();
        policy.on_become_host(&cx, &network).await.unwrap();

        let updated = cx.store.network_get(network.id).await.unwrap();
        assert_eq!(updated.dhcp_start, cx.config.flat_network_dhcp_start);

        let calls = driver.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            DriverCall::EnsureBridge { bridge, .. } if bridge == "br100"
        )));
        assert!(calls.iter().any(|c| matches!(
            c,
            DriverCall::UpdateDhcp { dhcp_listen, .. }
                if *dhcp_listen == network.gateway
        )));
    }

    #[tokio::test]
    async fn test_setup_compute_network_bridges_instance_networks() {
        use nimbus_core::VirtualInterface;
        use uuid::Uuid;

        let driver = Arc::new(MockDriver::new());
        let cx = test_context(driver.clone(), "host-a").await;
        let network = seed_network(&cx, "10.0.0.0/24", Some("host-a"), None).await;
        let instance = Uuid::new_v4();
        cx.store
            .virtual_interface_create(VirtualInterface {
                id: 0,
                mac: "02:16:3e:00:00:01".to_string(),
                instance_id: instance,
                network_id: network.id,
            })
            .await
            .unwrap();

        FlatDhcpPolicy::new()
            .setup_compute_network(&cx, instance)
            .await
            .unwrap();

        assert!(driver
            .calls()
            .iter()
            .any(|c| matches!(c, DriverCall::EnsureBridge { bridge, .. } if bridge == "br100")));
    }

    #[tokio::test]
    async fn test_on_become_host_skips_driver_on_fake_network() {
        let driver = Arc::new(MockDriver::new());
        let mut cx = test_context(driver.clone(), "host-a").await;
        cx.config.fake_network = true;
        let network = seed_network(&cx, "10.0.0.0/24", Some("host-a"), None).await;

        FlatDhcpPolicy::new()
            .on_become_host(&cx, &network)
            .await
            .unwrap();

        assert!(!driver
            .calls()
            .iter()
            .any(|c| matches!(c, DriverCall::UpdateDhcp { .. })));
    }
}
