use crate::error::Result;
use async_trait::async_trait;
use nimbus_storage::Store;
use std::sync::Arc;

/// Quota accounting contract; the engine only asks one question
#[async_trait]
pub trait Quota: Send + Sync {
    /// How many more floating ips the project may allocate, given it is
    /// asking for `requested`
    async fn allowed_floating_ips(&self, project_id: &str, requested: u32) -> Result<u32>;
}

/// Flat per-project cap counted against the store
pub struct StaticQuota {
    store: Arc<dyn Store>,
    per_project: u32,
}

impl StaticQuota {
    pub fn new(store: Arc<dyn Store>, per_project: u32) -> Self {
        Self { store, per_project }
    }
}

#[async_trait]
impl Quota for StaticQuota {
    async fn allowed_floating_ips(&self, project_id: &str, requested: u32) -> Result<u32> {
        let used = self.store.floating_ip_count_by_project(project_id).await? as u32;
        Ok(self.per_project.saturating_sub(used).min(requested))
    }
}
