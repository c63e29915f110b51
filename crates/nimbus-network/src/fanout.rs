use crate::bus::{Bus, RpcRequest};
use crate::error::{NetworkError, Result};
use nimbus_core::{InstanceId, Network, NetworkId};
use nimbus_storage::Store;
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// Capability for dispatching fixed-ip allocation to the host that owns
/// a network.
///
/// FlatDHCP and VLAN hosts compose this so dnsmasq is always configured
/// on the machine actually serving the network.
pub struct RpcFanout {
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
    topic: String,
    host: String,
    fake_call: bool,
}

impl RpcFanout {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<dyn Store>,
        topic: impl Into<String>,
        host: impl Into<String>,
        fake_call: bool,
    ) -> Self {
        Self {
            bus,
            store,
            topic: topic.into(),
            host: host.into(),
            fake_call,
        }
    }

    /// Host that must perform the allocation: the requesting compute
    /// host on multi-host networks, the owning network host otherwise
    pub fn target_host(&self, network: &Network, requested_host: &str) -> String {
        if network.multi_host {
            requested_host.to_string()
        } else {
            network
                .host
                .clone()
                .unwrap_or_else(|| requested_host.to_string())
        }
    }

    /// Whether the allocation has to travel over the bus
    pub fn is_remote(&self, target_host: &str) -> bool {
        !self.fake_call && target_host != self.host
    }

    /// Ask the owning host to allocate a fixed ip and return the address
    pub async fn call_allocate(
        &self,
        target_host: String,
        instance_id: InstanceId,
        network_id: NetworkId,
    ) -> Result<Ipv4Addr> {
        let queue = self.store.queue_get_for(&self.topic, &target_host).await?;
        debug!(
            "dispatching fixed ip allocation for network {} to {}",
            network_id, queue
        );
        let request = RpcRequest::new(
            "allocate_fixed_ip",
            json!({"instance_id": instance_id, "network_id": network_id}),
        );
        let reply = self.bus.call(&queue, request).await?;
        serde_json::from_value(reply)
            .map_err(|e| NetworkError::bus(format!("malformed allocation reply: {}", e)))
    }
}
