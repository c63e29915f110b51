use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use nimbus_core::Network;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

/// Contract for the low-level packet-forwarding backend that programs
/// bridges, iptables rules and the dhcp daemon.
///
/// All operations are idempotent; callers may re-run them freely, and
/// startup reconciliation depends on that.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// One-time per-process setup
    async fn init_host(&self) -> Result<()>;

    /// Make sure the metadata address answers locally
    async fn ensure_metadata_ip(&self) -> Result<()>;

    /// Forward metadata requests to the api server
    async fn metadata_forward(&self) -> Result<()>;

    /// Create the bridge if missing, enslaving `interface` when given
    async fn ensure_bridge(
        &self,
        bridge: &str,
        interface: Option<&str>,
        network: Option<&Network>,
    ) -> Result<()>;

    /// Create the vlan and its bridge if missing
    async fn ensure_vlan_bridge(
        &self,
        vlan: u16,
        bridge: &str,
        interface: Option<&str>,
        network: Option<&Network>,
    ) -> Result<()>;

    /// Forward a public vpn endpoint to its private address
    async fn ensure_vlan_forward(
        &self,
        public_ip: Ipv4Addr,
        port: u16,
        private_ip: Ipv4Addr,
    ) -> Result<()>;

    /// Rewrite the network's dhcp config and poke the daemon
    async fn update_dhcp(&self, network: &Network, dhcp_listen: Ipv4Addr) -> Result<()>;

    /// Rewrite the network's router-advertisement config
    async fn update_ra(&self, network: &Network) -> Result<()>;

    /// Bring a floating address up on the public interface
    async fn bind_floating_ip(&self, address: Ipv4Addr, allow_already_bound: bool) -> Result<()>;

    async fn unbind_floating_ip(&self, address: Ipv4Addr) -> Result<()>;

    /// Install the floating→fixed forward
    async fn ensure_floating_forward(&self, floating: Ipv4Addr, fixed: Ipv4Addr) -> Result<()>;

    async fn remove_floating_forward(&self, floating: Ipv4Addr, fixed: Ipv4Addr) -> Result<()>;

    /// Link-local v6 address of a local device
    async fn get_dev_linklocal(&self, device: &str) -> Result<Ipv6Addr>;
}

/// One recorded driver invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    InitHost,
    EnsureMetadataIp,
    MetadataForward,
    EnsureBridge {
        bridge: String,
        interface: Option<String>,
    },
    EnsureVlanBridge {
        vlan: u16,
        bridge: String,
        interface: Option<String>,
    },
    EnsureVlanForward {
        public_ip: Ipv4Addr,
        port: u16,
        private_ip: Ipv4Addr,
    },
    UpdateDhcp {
        network_id: u64,
        dhcp_listen: Ipv4Addr,
    },
    UpdateRa {
        network_id: u64,
    },
    BindFloatingIp {
        address: Ipv4Addr,
        allow_already_bound: bool,
    },
    UnbindFloatingIp {
        address: Ipv4Addr,
    },
    EnsureFloatingForward {
        floating: Ipv4Addr,
        fixed: Ipv4Addr,
    },
    RemoveFloatingForward {
        floating: Ipv4Addr,
        fixed: Ipv4Addr,
    },
}

/// Recording driver for tests and fake deployments.
///
/// Every call is appended to an in-memory log; `fail_bind_for` primes
/// bind failures so reconciliation skip-and-continue paths can be
/// exercised.
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    fail_bind_for: Mutex<Vec<Ipv4Addr>>,
    linklocal: Ipv6Addr,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_bind_for: Mutex::new(Vec::new()),
            linklocal: "fe80::f816:3eff:fe00:1".parse().unwrap(),
        }
    }

    /// Snapshot of the recorded calls
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, predicate: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    /// Prime `bind_floating_ip` to fail for an address
    pub fn fail_bind_for(&self, address: Ipv4Addr) {
        self.fail_bind_for.lock().unwrap().push(address);
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkDriver for MockDriver {
    async fn init_host(&self) -> Result<()> {
        self.record(DriverCall::InitHost);
        Ok(())
    }

    async fn ensure_metadata_ip(&self) -> Result<()> {
        self.record(DriverCall::EnsureMetadataIp);
        Ok(())
    }

    async fn metadata_forward(&self) -> Result<()> {
        self.record(DriverCall::MetadataForward);
        Ok(())
    }

    async fn ensure_bridge(
        &self,
        bridge: &str,
        interface: Option<&str>,
        _network: Option<&Network>,
    ) -> Result<()> {
        self.record(DriverCall::EnsureBridge {
            bridge: bridge.to_string(),
            interface: interface.map(str::to_string),
        });
        Ok(())
    }

    async fn ensure_vlan_bridge(
        &self,
        vlan: u16,
        bridge: &str,
        interface: Option<&str>,
        _network: Option<&Network>,
    ) -> Result<()> {
        self.record(DriverCall::EnsureVlanBridge {
            vlan,
            bridge: bridge.to_string(),
            interface: interface.map(str::to_string),
        });
        Ok(())
    }

    async fn ensure_vlan_forward(
        &self,
        public_ip: Ipv4Addr,
        port: u16,
        private_ip: Ipv4Addr,
    ) -> Result<()> {
        self.record(DriverCall::EnsureVlanForward {
            public_ip,
            port,
            private_ip,
        });
        Ok(())
    }

    async fn update_dhcp(&self, network: &Network, dhcp_listen: Ipv4Addr) -> Result<()> {
        self.record(DriverCall::UpdateDhcp {
            network_id: network.id,
            dhcp_listen,
        });
        Ok(())
    }

    async fn update_ra(&self, network: &Network) -> Result<()> {
        self.record(DriverCall::UpdateRa {
            network_id: network.id,
        });
        Ok(())
    }

    async fn bind_floating_ip(&self, address: Ipv4Addr, allow_already_bound: bool) -> Result<()> {
        if self.fail_bind_for.lock().unwrap().contains(&address) {
            return Err(NetworkError::driver(format!(
                "unable to bind {} on the public interface",
                address
            )));
        }
        self.record(DriverCall::BindFloatingIp {
            address,
            allow_already_bound,
        });
        Ok(())
    }

    async fn unbind_floating_ip(&self, address: Ipv4Addr) -> Result<()> {
        self.record(DriverCall::UnbindFloatingIp { address });
        Ok(())
    }

    async fn ensure_floating_forward(&self, floating: Ipv4Addr, fixed: Ipv4Addr) -> Result<()> {
        self.record(DriverCall::EnsureFloatingForward { floating, fixed });
        Ok(())
    }

    async fn remove_floating_forward(&self, floating: Ipv4Addr, fixed: Ipv4Addr) -> Result<()> {
        self.record(DriverCall::RemoveFloatingForward { floating, fixed });
        Ok(())
    }

    async fn get_dev_linklocal(&self, _device: &str) -> Result<Ipv6Addr> {
        Ok(self.linklocal)
    }
}
