//! Handle bound to one record.

use tracing::debug;

use super::control::StoreControl;
use super::error::{StoreError, optional};
use super::metrics::{METRIC_INDEX_REBUILD, count};
use super::writes::{PendingWrite, WriteOp};
use crate::domain::value::{FieldValue, Record};

/// Increment applied by [`Instance::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    By(i64),
    ByFloat(f64),
}

/// Field-level access to the record behind one unique key.
///
/// The record is loaded into the cache on first use. Writes touch only the
/// given fields and keep the entity's indexes in step.
#[derive(Clone)]
pub struct Instance<'a> {
    store: &'a StoreControl,
    uk: FieldValue,
    key: String,
}

impl<'a> Instance<'a> {
    pub(crate) fn new(store: &'a StoreControl, uk: FieldValue) -> Self {
        let key = store.keys().primary(&uk);
        Self { store, uk, key }
    }

    pub fn uk(&self) -> &FieldValue {
        &self.uk
    }

    pub fn cache_key(&self) -> &str {
        &self.key
    }

    pub async fn get_or_fail(&self) -> Result<Record, StoreError> {
        self.store.get_or_fail(&self.uk).await
    }

    pub async fn get(&self) -> Result<Option<Record>, StoreError> {
        optional(self.get_or_fail().await)
    }

    async fn ensure_loaded(&self) -> Result<(), StoreError> {
        if !self.store.kv().exists(&self.key).await? {
            self.store.load(&self.uk).await?;
        }
        Ok(())
    }

    fn reject_key_change(&self, field: &str) -> Result<(), StoreError> {
        if field == self.store.descriptor().unique_key() {
            return Err(StoreError::validation(format!(
                "unique key `{field}` of `{}` cannot be changed through a record handle",
                self.store.descriptor().name()
            )));
        }
        Ok(())
    }

    async fn rebuild_index(&self) -> Result<(), StoreError> {
        self.store.build_index(&self.uk).await?;
        count(METRIC_INDEX_REBUILD, self.store.descriptor().name());
        debug!(entity = %self.store.descriptor().name(), uk = %self.uk, "indexes rebuilt");
        Ok(())
    }

    /// Overwrite `items` in the cache and patch them into the backing store.
    ///
    /// Fields outside the entity's cached fields are only written to the
    /// backing store.
    pub async fn set_items(&self, items: &Record) -> Result<PendingWrite, StoreError> {
        for field in items.fields() {
            self.reject_key_change(field)?;
        }
        self.ensure_loaded().await?;

        let descriptor = self.store.descriptor();
        let reindex = items.fields().any(|field| descriptor.is_indexed(field));
        if reindex {
            self.store.del_index(&self.uk).await?;
        }

        let pairs: Vec<(String, String)> = items
            .to_cache_pairs()
            .into_iter()
            .filter(|(field, _)| descriptor.is_cached(field))
            .collect();
        if !pairs.is_empty() {
            self.store.kv().hset_multiple(&self.key, &pairs).await?;
        }

        if reindex {
            self.rebuild_index().await?;
        }

        let op = WriteOp::Patch {
            filter: self.store.uk_filter(&self.uk)?,
            fields: items.clone(),
        };
        self.store
            .writes
            .submit(op, self.store.blocking_writes(false))
            .await
    }

    /// Add `step` to a numeric field; returns the new value.
    pub async fn step(
        &self,
        field: &str,
        step: Step,
    ) -> Result<(FieldValue, PendingWrite), StoreError> {
        self.reject_key_change(field)?;
        self.ensure_loaded().await?;

        let descriptor = self.store.descriptor();
        let reindex = descriptor.is_indexed(field);
        if reindex {
            self.store.del_index(&self.uk).await?;
        }

        let kv = self.store.kv();
        let value = match step {
            Step::By(delta) => FieldValue::Int(kv.hincr_by(&self.key, field, delta).await?),
            Step::ByFloat(delta) => {
                FieldValue::Float(kv.hincr_by_float(&self.key, field, delta).await?)
            }
        };

        if reindex {
            self.rebuild_index().await?;
        }

        let op = WriteOp::Patch {
            filter: self.store.uk_filter(&self.uk)?,
            fields: Record::new().with(field, value.clone()),
        };
        let pending = self
            .store
            .writes
            .submit(op, self.store.blocking_writes(false))
            .await?;
        Ok((value, pending))
    }
}

impl std::fmt::Debug for Instance<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("entity", &self.store.descriptor().name())
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::application::kv::KvClient;
    use crate::application::store::writes::RetryPolicy;
    use crate::cache::memory::MemoryKv;
    use crate::domain::descriptor::{EntityDescriptor, SyncMode};
    use crate::infra::memory::MemoryRepo;

    fn store(kv: Arc<MemoryKv>, repo: Arc<MemoryRepo>) -> StoreControl {
        let descriptor = EntityDescriptor::builder("User")
            .index("email")
            .sync_mode(SyncMode::Sync)
            .build()
            .expect("descriptor");
        StoreControl::new(descriptor, kv, repo, RetryPolicy::no_retry()).expect("store")
    }

    #[tokio::test]
    async fn step_increments_cache_and_backing_row() {
        let kv = Arc::new(MemoryKv::new());
        let repo = Arc::new(MemoryRepo::new("id"));
        repo.seed([Record::new().with("id", 1).with("age", 30)]);
        let store = store(kv.clone(), repo.clone());

        let (value, pending) = store
            .instance(1)
            .step("age", Step::By(2))
            .await
            .expect("step");
        pending.wait().await.expect("write");

        assert_eq!(value, FieldValue::Int(32));
        assert_eq!(repo.rows()[0].get("age"), Some(&FieldValue::Int(32)));
    }

    #[tokio::test]
    async fn float_step_increments_cache_and_backing_row() {
        let kv = Arc::new(MemoryKv::new());
        let repo = Arc::new(MemoryRepo::new("id"));
        repo.seed([Record::new().with("id", 1).with("score", 1.0)]);
        let store = store(kv.clone(), repo.clone());

        let (value, pending) = store
            .instance(1)
            .step("score", Step::ByFloat(0.5))
            .await
            .expect("step");
        pending.wait().await.expect("write");

        assert_eq!(value, FieldValue::Float(1.5));
        let hash = kv.hgetall("User:1").await.expect("hgetall");
        assert_eq!(hash.get("score").map(String::as_str), Some("1.5"));
        assert_eq!(repo.rows()[0].get("score"), Some(&FieldValue::Float(1.5)));
    }

    #[tokio::test]
    async fn step_on_text_field_fails() {
        let kv = Arc::new(MemoryKv::new());
        let repo = Arc::new(MemoryRepo::new("id"));
        repo.seed([Record::new().with("id", 1).with("name", "A")]);
        let store = store(kv, repo);

        let err = store
            .instance(1)
            .step("name", Step::By(1))
            .await
            .expect_err("not numeric");
        assert!(matches!(err, StoreError::Kv(_)));
    }

    #[tokio::test]
    async fn set_items_moves_the_unique_index() {
        let kv = Arc::new(MemoryKv::new());
        let repo = Arc::new(MemoryRepo::new("id"));
        repo.seed([Record::new().with("id", 1).with("email", "old@x")]);
        let store = store(kv.clone(), repo);

        store
            .instance(1)
            .set_items(&Record::new().with("email", "new@x"))
            .await
            .expect("set");

        assert!(!kv.exists("User-email:old@x").await.expect("exists"));
        assert_eq!(
            kv.get("User-email:new@x").await.expect("get"),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn unique_key_cannot_be_rewritten() {
        let kv = Arc::new(MemoryKv::new());
        let repo = Arc::new(MemoryRepo::new("id"));
        let store = store(kv, repo);

        let err = store
            .instance(1)
            .set_items(&Record::new().with("id", 2))
            .await
            .expect_err("key change");
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let kv = Arc::new(MemoryKv::new());
        let repo = Arc::new(MemoryRepo::new("id"));
        let store = store(kv, repo);

        assert!(store.instance(5).get().await.expect("get").is_none());
        let err = store
            .instance(5)
            .set_items(&Record::new().with("name", "A"))
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }
}
