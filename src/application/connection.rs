//! Shared cache client and backing-store provider.

use std::sync::Arc;

use super::kv::KvClient;
use super::repos::{EntityRepo, RepoProvider};
use super::store::{FailureHook, RetryPolicy, StoreControl, StoreError, WriteFailure};
use crate::domain::descriptor::EntityDescriptor;

/// Entry point handing out one [`StoreControl`] per entity descriptor.
///
/// Cloning is cheap; clones share the cache client and repositories.
#[derive(Clone)]
pub struct Connection {
    kv: Arc<dyn KvClient>,
    repos: Arc<dyn RepoProvider>,
    retry: RetryPolicy,
    on_write_failure: Option<FailureHook>,
}

impl Connection {
    pub fn open(kv: Arc<dyn KvClient>, repos: Arc<dyn RepoProvider>) -> Self {
        Self {
            kv,
            repos,
            retry: RetryPolicy::default(),
            on_write_failure: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Hook shared by every store created from this connection.
    pub fn on_write_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WriteFailure) + Send + Sync + 'static,
    {
        self.on_write_failure = Some(Arc::new(hook));
        self
    }

    pub fn kv(&self) -> &Arc<dyn KvClient> {
        &self.kv
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn repository(&self, descriptor: &EntityDescriptor) -> Arc<dyn EntityRepo> {
        self.repos.repository(descriptor)
    }

    pub fn store_control(&self, descriptor: EntityDescriptor) -> Result<StoreControl, StoreError> {
        let repo = self.repository(&descriptor);
        let store = StoreControl::new(descriptor, self.kv.clone(), repo, self.retry)?;
        Ok(match &self.on_write_failure {
            Some(hook) => store.with_shared_failure_hook(hook.clone()),
            None => store,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::time::Duration;

    use super::*;
    use crate::cache::memory::MemoryKv;
    use crate::domain::filter::Filter;
    use crate::domain::value::Record;
    use crate::infra::memory::MemoryRepositories;

    #[tokio::test]
    async fn stores_share_the_connection_settings() {
        let repos = Arc::new(MemoryRepositories::new());
        let retry = RetryPolicy::new(NonZeroU32::new(5).expect("non-zero"), Duration::ZERO);
        let connection =
            Connection::open(Arc::new(MemoryKv::new()), repos.clone()).with_retry_policy(retry);

        let descriptor = EntityDescriptor::builder("User")
            .table("users")
            .build()
            .expect("descriptor");
        let store = connection.store_control(descriptor).expect("store");
        repos.table("users", "id").seed([Record::new().with("id", 1)]);

        assert_eq!(store.retry_policy(), retry);
        assert!(Arc::ptr_eq(store.kv(), connection.kv()));
        let rows = connection
            .repository(store.descriptor())
            .find_many(&Filter::all())
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn invalid_descriptor_is_rejected_by_the_builder() {
        let result = EntityDescriptor::builder("User")
            .index("email")
            .cache_fields(["name"])
            .build();
        assert!(result.is_err());
    }
}
