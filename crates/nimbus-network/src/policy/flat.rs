use crate::error::Result;
use crate::host::{CreateNetworksSpec, HostContext};
use crate::policy::{ReservedSlots, TopologyPolicy};
use async_trait::async_trait;
use nimbus_core::{InstanceId, Network};
use nimbus_storage::{NetworkUpdate, Store};

/// Basic networking where no vlans are used.
///
/// The deployment is responsible for creating the bridge named on each
/// network; no bridge or dhcp setup happens here. Deallocated fixed ips
/// return to the pool immediately since no dhcp lease holds them.
pub struct FlatPolicy {
    reserved: ReservedSlots,
}

impl FlatPolicy {
    pub fn new() -> Self {
        Self {
            reserved: ReservedSlots::base(),
        }
    }
}

impl Default for FlatPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopologyPolicy for FlatPolicy {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn reserved_slots(&self) -> ReservedSlots {
        self.reserved
    }

    fn timeout_fixed_ips(&self) -> bool {
        false
    }

    fn manages_dhcp(&self) -> bool {
        false
    }

    fn uses_rpc_fanout(&self) -> bool {
        false
    }

    fn supports_floating(&self) -> bool {
        false
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
                    injected: Some(cx.config.flat_injected),
                    dns: Some(cx.config.flat_network_dns),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn setup_compute_network(
        &self,
        _cx: &HostContext,
        _instance_id: InstanceId,
    ) -> Result<()> {
        // the bridge is created manually by the deployment
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::host::test_support::{seed_network, test_context};
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_networks_for_instance_skips_vlan_and_unhosted() {
        let cx = test_context(Arc::new(MockDriver::new()), "host-a").await;
        seed_network(&cx, "10.0.0.0/24", Some("host-a"), None).await;
        seed_network(&cx, "10.0.1.0/24", None, None).await;
        seed_network(&cx, "10.0.2.0/24", Some("host-b"), Some(100)).await;

        let policy = FlatPolicy::new();
        let networks = policy
            .networks_for_instance(&cx, Uuid::new_v4(), "proj")
            .await
            .unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].cidr.to_string(), "10.0.0.0/24");
    }

    #[tokio::test]
    async fn test_on_become_host_marks_injected_and_dns() {
        let cx = test_context(Arc::new(MockDriver::new()), "host-a").await;
        let network = seed_network(&cx, "10.0.0.0/24", Some("host-a"), None).await;

        let policy = FlatPolicy::new();
        policy.on_become_host(&cx, &network).await.unwrap();
        policy.on_become_host(&cx, &network).await.unwrap();

        let updated = cx.store.network_get(network.id).await.unwrap();
        assert!(updated.injected);
        assert_eq!(updated.dns, Some(cx.config.flat_network_dns));
    }
}
