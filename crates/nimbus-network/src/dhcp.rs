use crate::error::Result;
use crate::host::HostContext;
use nimbus_core::Network;
use nimbus_storage::{NetworkUpdate, Store};
use std::net::Ipv4Addr;

/// The address the dhcp daemon should listen on for a network.
///
/// Multi-host networks get the ip assigned to this host; otherwise dhcp
/// listens on the gateway.
pub async fn dhcp_listen_address(cx: &HostContext, network: &Network) -> Result<Ipv4Addr> {
    if network.multi_host {
        Ok(cx.store.network_get_host_ip(&cx.host).await?)
    } else {
        Ok(network.gateway)
    }
}

/// Rewrite a network's dhcp config through the driver; a no-op when the
/// deployment runs with fake networking
pub async fn refresh_dhcp(cx: &HostContext, network: &Network) -> Result<()> {
    if cx.config.fake_network {
        return Ok(());
    }
    let dhcp_listen = dhcp_listen_address(cx, network).await?;
    cx.driver.update_dhcp(network, dhcp_listen).await
}

/// Refresh router advertisements and record the bridge link-local
/// address as the network's v6 gateway
pub async fn refresh_ra(cx: &HostContext, network_id: u64) -> Result<()> {
    if !cx.config.use_ipv6 || cx.config.fake_network {
        return Ok(());
    }
    let network = cx.store.network_get(network_id).await?;
    cx.driver.update_ra(&network).await?;
    let gateway = cx.driver.get_dev_linklocal(&network.bridge).await?;
    cx.store
        .network_update(
            network_id,
            NetworkUpdate {
                gateway_v6: Some(gateway),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}
