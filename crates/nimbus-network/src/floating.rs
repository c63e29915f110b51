use crate::driver::NetworkDriver;
use crate::error::{NetworkError, Result};
use crate::quota::Quota;
use nimbus_core::InstanceId;
use nimbus_storage::Store;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Floating-ip capability composed onto FlatDHCP and VLAN hosts.
///
/// Floating handling wraps fixed handling: on allocation fixed ips come
/// first so an auto-assigned floating ip has something to bind to; on
/// deallocation floating ips are released first.
pub struct FloatingIpOps {
    store: Arc<dyn Store>,
    driver: Arc<dyn NetworkDriver>,
    quota: Arc<dyn Quota>,
    host: String,
}

impl FloatingIpOps {
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn NetworkDriver>,
        quota: Arc<dyn Quota>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            driver,
            quota,
            host: host.into(),
        }
    }

    /// Re-apply bind and forward for every association this host serves.
    ///
    /// Runs at startup; per-address failures are logged and skipped so
    /// one broken binding cannot keep the host down.
    pub async fn init_host(&self) -> Result<()> {
        let floating_ips = self.store.floating_ip_get_all_by_host(&self.host).await?;
        for floating in floating_ips {
            let fixed_id = match floating.fixed_ip_id {
                Some(id) => id,
                None => continue,
            };
            if let Err(e) = self.rebind(floating.address, fixed_id).await {
                warn!(
                    "skipping floating ip {} during startup: {}",
                    floating.address, e
                );
            }
        }
        Ok(())
    }

    async fn rebind(&self, floating_address: Ipv4Addr, fixed_id: u64) -> Result<()> {
        let fixed = self.store.fixed_ip_get_by_id(fixed_id).await?;
        // the ip may already be up from a previous run of this host
        self.driver.bind_floating_ip(floating_address, true).await?;
        self.driver
            .ensure_floating_forward(floating_address, fixed.address)
            .await
    }

    /// Get a floating ip from the pool for a project
    pub async fn allocate(&self, project_id: &str) -> Result<Ipv4Addr> {
        if self.quota.allowed_floating_ips(project_id, 1).await? < 1 {
            warn!("quota exceeded for {}, tried to allocate address", project_id);
            return Err(NetworkError::quota_exceeded(project_id));
        }
        let address = self.store.floating_ip_allocate_address(project_id).await?;
        debug!("allocated floating ip {} for {}", address, project_id);
        Ok(address)
    }

    /// Associate a floating ip with a fixed ip and program the driver
    pub async fn associate(
        &self,
        floating_address: Ipv4Addr,
        fixed_address: Ipv4Addr,
    ) -> Result<()> {
        self.store
            .floating_ip_fixed_ip_associate(floating_address, fixed_address, &self.host)
            .await?;
        self.driver.bind_floating_ip(floating_address, false).await?;
        self.driver
            .ensure_floating_forward(floating_address, fixed_address)
            .await
    }

    /// Disassociate a floating ip; idempotent when not associated
    pub async fn disassociate(&self, floating_address: Ipv4Addr) -> Result<Option<Ipv4Addr>> {
        let fixed_address = self.store.floating_ip_disassociate(floating_address).await?;
        let fixed_address = match fixed_address {
            Some(address) => address,
            None => {
                debug!("floating ip {} was not associated", floating_address);
                return Ok(None);
            }
        };
        self.driver.unbind_floating_ip(floating_address).await?;
        self.driver
            .remove_floating_forward(floating_address, fixed_address)
            .await?;
        Ok(Some(fixed_address))
    }

    /// Return a floating ip to the pool; it must not be associated
    pub async fn deallocate(&self, floating_address: Ipv4Addr) -> Result<()> {
        self.store.floating_ip_deallocate(floating_address).await?;
        debug!("deallocated floating ip {}", floating_address);
        Ok(())
    }

    /// Allocate a floating ip marked auto-assigned and associate it with
    /// the instance's first fixed ip
    pub async fn auto_assign(
        &self,
        instance_id: InstanceId,
        project_id: &str,
    ) -> Result<Option<Ipv4Addr>> {
        let address = self.allocate(project_id).await?;
        self.store.floating_ip_set_auto_assigned(address).await?;
        let fixed_ips = self.store.fixed_ip_get_by_instance(instance_id).await?;
        let fixed = match fixed_ips.first() {
            Some(fixed) => fixed.address,
            None => {
                warn!(
                    "instance {} has no fixed ip to auto-assign {} to",
                    instance_id, address
                );
                return Ok(None);
            }
        };
        self.associate(address, fixed).await?;
        Ok(Some(address))
    }

    /// Release every floating ip riding on the instance's fixed ips;
    /// auto-assigned ones go back to the pool
    pub async fn deallocate_for_instance(&self, instance_id: InstanceId) -> Result<()> {
        let fixed_ips = self.store.fixed_ip_get_by_instance(instance_id).await?;
        for fixed_ip in fixed_ips {
            let floating_ips = self.store.floating_ip_get_by_fixed(fixed_ip.address).await?;
            for floating in floating_ips {
                self.disassociate(floating.address).await?;
                if floating.auto_assigned {
                    self.deallocate(floating.address).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, MockDriver};
    use crate::quota::StaticQuota;
    use nimbus_core::{FixedIp, Network};
    use nimbus_storage::{MemoryStore, StorageError};
    use uuid::Uuid;

    struct Harness {
        ops: FloatingIpOps,
        store: Arc<MemoryStore>,
        driver: Arc<MockDriver>,
    }

    async fn make_ops(quota_limit: u32) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(MockDriver::new());
        let quota = Arc::new(StaticQuota::new(store.clone(), quota_limit));
        let ops = FloatingIpOps::new(store.clone(), driver.clone(), quota, "host-a");

        let cidr: ipnet::Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let network = store
            .network_create_safe(Network {
                id: 0,
                label: "net".to_string(),
                cidr,
                cidr_v6: None,
                netmask: cidr.netmask(),
                netmask_v6: None,
                gateway: Ipv4Addr::new(10, 0, 0, 1),
                gateway_v6: None,
                broadcast: cidr.broadcast(),
                bridge: "br100".to_string(),
                bridge_interface: None,
                vlan: None,
                vpn_public_address: None,
                vpn_public_port: None,
                vpn_private_address: None,
                dns: None,
                dhcp_start: Ipv4Addr::new(10, 0, 0, 2),
                injected: false,
                multi_host: false,
                host: Some("host-a".to_string()),
                project_id: None,
            })
            .await
            .unwrap()
            .unwrap();
        store
            .fixed_ip_create(FixedIp::unassociated(
                network.id,
                Ipv4Addr::new(10, 0, 0, 2),
                false,
            ))
            .await
            .unwrap();
        store
            .floating_ip_create(Ipv4Addr::new(4, 4, 4, 10))
            .await
            .unwrap();
        store
            .floating_ip_create(Ipv4Addr::new(4, 4, 4, 11))
            .await
            .unwrap();

        Harness { ops, store, driver }
    }

    #[tokio::test]
    async fn test_allocate_respects_quota() {
        let h = make_ops(1).await;
        let address = h.ops.allocate("proj").await.unwrap();
        assert_eq!(address, Ipv4Addr::new(4, 4, 4, 10));

        let err = h.ops.allocate("proj").await.unwrap_err();
        assert!(matches!(err, NetworkError::QuotaExceeded { .. }));
        // another project is unaffected
        assert!(h.ops.allocate("other").await.is_ok());
    }

    #[tokio::test]
    async fn test_associate_disassociate_round_trip() {
        let h = make_ops(10).await;
        let floating = h.ops.allocate("proj").await.unwrap();
        let fixed = Ipv4Addr::new(10, 0, 0, 2);

        h.ops.associate(floating, fixed).await.unwrap();
        let row = h.store.floating_ip_get_by_address(floating).await.unwrap();
        assert!(row.fixed_ip_id.is_some());
        assert_eq!(row.host.as_deref(), Some("host-a"));
        assert!(h.driver.calls().contains(&DriverCall::BindFloatingIp {
            address: floating,
            allow_already_bound: false,
        }));
        assert!(h
            .driver
            .calls()
            .contains(&DriverCall::EnsureFloatingForward { floating, fixed }));

        // double association is a conflict
        let err = h.ops.associate(floating, fixed).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Storage(StorageError::AlreadyAssociated { .. })
        ));

        let released = h.ops.disassociate(floating).await.unwrap();
        assert_eq!(released, Some(fixed));
        let row = h.store.floating_ip_get_by_address(floating).await.unwrap();
        assert!(row.fixed_ip_id.is_none());
        assert!(row.host.is_none());
        assert!(h
            .driver
            .calls()
            .contains(&DriverCall::RemoveFloatingForward { floating, fixed }));

        // second disassociate is a quiet no-op
        assert_eq!(h.ops.disassociate(floating).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deallocate_requires_no_association() {
        let h = make_ops(10).await;
        let floating = h.ops.allocate("proj").await.unwrap();
        h.ops
            .associate(floating, Ipv4Addr::new(10, 0, 0, 2))
            .await
            .unwrap();

        assert!(matches!(
            h.ops.deallocate(floating).await.unwrap_err(),
            NetworkError::Storage(StorageError::StillAssociated { .. })
        ));

        h.ops.disassociate(floating).await.unwrap();
        h.ops.deallocate(floating).await.unwrap();
        let row = h.store.floating_ip_get_by_address(floating).await.unwrap();
        assert!(row.project_id.is_none());
    }

    #[tokio::test]
    async fn test_auto_assign_marks_and_binds_first_fixed_ip() {
        let h = make_ops(10).await;
        let instance = Uuid::new_v4();
        let fixed = Ipv4Addr::new(10, 0, 0, 2);
        h.store.fixed_ip_associate(fixed, instance).await.unwrap();

        let floating = h.ops.auto_assign(instance, "proj").await.unwrap().unwrap();
        let row = h.store.floating_ip_get_by_address(floating).await.unwrap();
        assert!(row.auto_assigned);
        assert!(row.fixed_ip_id.is_some());

        // instance teardown returns the auto-assigned ip to the pool
        h.ops.deallocate_for_instance(instance).await.unwrap();
        let row = h.store.floating_ip_get_by_address(floating).await.unwrap();
        assert!(row.fixed_ip_id.is_none());
        assert!(row.project_id.is_none());
        assert!(!row.auto_assigned);
    }

    #[tokio::test]
    async fn test_init_host_rebinds_and_skips_failures() {
        let h = make_ops(10).await;
        let good = h.ops.allocate("proj").await.unwrap();
        h.ops
            .associate(good, Ipv4Addr::new(10, 0, 0, 2))
            .await
            .unwrap();

        // prime the second address to fail its bind on reconciliation
        let bad = h.ops.allocate("proj").await.unwrap();
        h.store
            .fixed_ip_create(FixedIp::unassociated(1, Ipv4Addr::new(10, 0, 0, 3), false))
            .await
            .unwrap();
        h.ops
            .associate(bad, Ipv4Addr::new(10, 0, 0, 3))
            .await
            .unwrap();
        h.driver.fail_bind_for(bad);

        h.ops.init_host().await.unwrap();

        let rebinds = h.driver.call_count(|c| {
            matches!(
                c,
                DriverCall::BindFloatingIp {
                    allow_already_bound: true,
                    ..
                }
            )
        });
        assert_eq!(rebinds, 1);
    }
}
