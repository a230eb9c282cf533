use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::error::{StoreError, optional};
use super::instance::Instance;
use super::lookup::{Lookup, member_window};
use super::metrics::{METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_LIST_MATERIALIZE, count};
use super::writes::{FailureHook, PendingWrite, RetryPolicy, WriteBack, WriteFailure, WriteOp};
use crate::application::kv::KvClient;
use crate::application::repos::EntityRepo;
use crate::cache::keys::KeySpace;
use crate::domain::coercion::Coercion;
use crate::domain::descriptor::{EntityDescriptor, SyncMode};
use crate::domain::filter::Filter;
use crate::domain::value::{FieldValue, Record};

/// Cache-aside controller of one entity type.
///
/// Reads are served from the cache and fall back to the backing store on a
/// miss. Mutations update the cache first and forward the change to the
/// backing store, blocking or detached according to the entity's
/// [`SyncMode`].
pub struct StoreControl {
    descriptor: EntityDescriptor,
    keys: KeySpace,
    kv: Arc<dyn KvClient>,
    repo: Arc<dyn EntityRepo>,
    pub(crate) writes: WriteBack,
}

impl StoreControl {
    pub fn new(
        descriptor: EntityDescriptor,
        kv: Arc<dyn KvClient>,
        repo: Arc<dyn EntityRepo>,
        policy: RetryPolicy,
    ) -> Result<Self, StoreError> {
        descriptor.validate()?;
        let keys = KeySpace::new(descriptor.name());
        let writes = WriteBack::new(descriptor.name(), repo.clone(), policy);
        Ok(Self {
            descriptor,
            keys,
            kv,
            repo,
            writes,
        })
    }

    /// Observe detached writes that exhausted their retries.
    pub fn with_failure_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WriteFailure) + Send + Sync + 'static,
    {
        self.writes.set_failure_hook(Arc::new(hook));
        self
    }

    pub(crate) fn with_shared_failure_hook(mut self, hook: FailureHook) -> Self {
        self.writes.set_failure_hook(hook);
        self
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn kv(&self) -> &Arc<dyn KvClient> {
        &self.kv
    }

    pub fn repository(&self) -> &Arc<dyn EntityRepo> {
        &self.repo
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.writes.policy()
    }

    pub(crate) fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub(crate) fn blocking_writes(&self, sync_once: bool) -> bool {
        sync_once || self.descriptor.sync_mode() == SyncMode::Sync
    }

    /// Backing-store filter of the row behind `uk`.
    ///
    /// Text keys are coerced to the declared kind of the unique-key field.
    pub fn uk_filter(&self, uk: &FieldValue) -> Result<Filter, StoreError> {
        let uk = match (uk, self.descriptor.coercion()) {
            (FieldValue::Text(raw), Coercion::Typed(_)) => self
                .descriptor
                .coercion()
                .apply_field(self.descriptor.unique_key(), raw)?,
            _ => uk.clone(),
        };
        Ok(self.descriptor.key_filter(&uk))
    }

    pub async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, StoreError> {
        self.repo
            .find_one(filter)
            .await
            .map_err(|err| StoreError::repo(self.name(), err, || describe(filter)))
    }

    pub async fn find_one_or_fail(&self, filter: &Filter) -> Result<Record, StoreError> {
        self.repo
            .find_one_or_fail(filter)
            .await
            .map_err(|err| StoreError::repo(self.name(), err, || describe(filter)))
    }

    async fn find_many(&self, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        self.repo
            .find_many(filter)
            .await
            .map_err(|err| StoreError::repo(self.name(), err, || describe(filter)))
    }

    /// Fetch the row behind `uk` and write it into the cache.
    #[instrument(skip(self), fields(entity = %self.name()))]
    pub async fn load(&self, uk: &FieldValue) -> Result<Record, StoreError> {
        let filter = self.uk_filter(uk)?;
        let record = self.find_one_or_fail(&filter).await?;
        self.store_in_cache(&record).await?;
        Ok(record)
    }

    /// Fetch rows by `field = value` and cache them; returns how many were cached.
    ///
    /// With `all == false` exactly one row must match.
    #[instrument(skip(self), fields(entity = %self.name()))]
    pub async fn load_by_field(
        &self,
        field: &str,
        value: &FieldValue,
        all: bool,
    ) -> Result<usize, StoreError> {
        let filter = Filter::eq(field, value.clone());
        if !all {
            let record = self.find_one_or_fail(&filter).await?;
            self.store_in_cache(&record).await?;
            return Ok(1);
        }
        let records = self.find_many(&filter).await?;
        for record in &records {
            self.store_in_cache(record).await?;
        }
        info!(entity = %self.name(), field, records = records.len(), "partition loaded");
        Ok(records.len())
    }

    pub(crate) fn record_uk(&self, record: &Record) -> Result<FieldValue, StoreError> {
        record
            .get(self.descriptor.unique_key())
            .filter(|value| !value.is_null())
            .cloned()
            .ok_or_else(|| {
                StoreError::validation(format!(
                    "`{}` record has no value for unique key `{}`",
                    self.name(),
                    self.descriptor.unique_key()
                ))
            })
    }

    /// Write the cached projection of `record` and its index entries.
    pub(crate) async fn store_in_cache(&self, record: &Record) -> Result<(), StoreError> {
        self.write_hash(record).await?;
        self.build_index_for(record).await
    }

    /// Merge the cached projection of `record` into its hash.
    async fn write_hash(&self, record: &Record) -> Result<FieldValue, StoreError> {
        let uk = self.record_uk(record)?;
        let pairs = record.project(self.descriptor.cache_fields()).to_cache_pairs();
        self.kv.hset_multiple(&self.keys.primary(&uk), &pairs).await?;
        Ok(uk)
    }

    async fn read_cached(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let hash = self.kv.hgetall(key).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            self.descriptor
                .coercion()
                .apply(Record::from_cache_hash(hash))?,
        ))
    }

    async fn ensure_primary(&self, uk: &FieldValue) -> Result<String, StoreError> {
        let key = self.keys.primary(uk);
        if self.kv.exists(&key).await? {
            count(METRIC_CACHE_HIT, self.name());
        } else {
            count(METRIC_CACHE_MISS, self.name());
            debug!(entity = %self.name(), %key, "cache miss");
            self.load(uk).await?;
        }
        Ok(key)
    }

    /// Record behind `uk`, loading it on a cache miss.
    #[instrument(skip(self), fields(entity = %self.name()))]
    pub async fn get_or_fail(&self, uk: &FieldValue) -> Result<Record, StoreError> {
        let key = self.ensure_primary(uk).await?;
        self.read_cached(&key).await?.ok_or_else(|| {
            StoreError::not_found(
                self.name(),
                format!("{} = {uk}", self.descriptor.unique_key()),
            )
        })
    }

    pub async fn get(&self, uk: &FieldValue) -> Result<Option<Record>, StoreError> {
        optional(self.get_or_fail(uk).await)
    }

    /// Unique key behind a unique-index value, loading by field when unindexed.
    async fn resolve_index(&self, field: &str, value: &FieldValue) -> Result<String, StoreError> {
        if !self.descriptor.is_index_field(field) {
            return Err(StoreError::configuration(self.name(), field, "unique index"));
        }
        let index_key = self.keys.index(field, value);
        if let Some(uk) = self.kv.get(&index_key).await? {
            return Ok(uk);
        }
        count(METRIC_CACHE_MISS, self.name());
        self.load_by_field(field, value, false).await?;
        self.kv
            .get(&index_key)
            .await?
            .ok_or_else(|| StoreError::not_found(self.name(), format!("{field} = {value}")))
    }

    /// Record whose unique-index `field` equals `value`.
    #[instrument(skip(self), fields(entity = %self.name()))]
    pub async fn get_by_index_or_fail(
        &self,
        field: &str,
        value: &FieldValue,
    ) -> Result<Record, StoreError> {
        let uk = self.resolve_index(field, value).await?;
        let key = self.keys.primary_raw(&uk);
        if self.kv.exists(&key).await? {
            count(METRIC_CACHE_HIT, self.name());
        } else {
            count(METRIC_CACHE_MISS, self.name());
            self.load_by_field(field, value, false).await?;
        }
        self.read_cached(&key)
            .await?
            .ok_or_else(|| StoreError::not_found(self.name(), format!("{field} = {value}")))
    }

    pub async fn get_by_index(
        &self,
        field: &str,
        value: &FieldValue,
    ) -> Result<Option<Record>, StoreError> {
        optional(self.get_by_index_or_fail(field, value).await)
    }

    /// Unique keys of a multi-index partition, newest first.
    async fn resolve_multi(
        &self,
        field: &str,
        value: &FieldValue,
        count_limit: i64,
        start: usize,
    ) -> Result<Vec<String>, StoreError> {
        if !self.descriptor.is_multi_index_field(field) {
            return Err(StoreError::configuration(self.name(), field, "multi index"));
        }
        let index_key = self.keys.index(field, value);
        if !self.kv.exists(&index_key).await? {
            count(METRIC_CACHE_MISS, self.name());
            self.load_by_field(field, value, true).await?;
        }
        let members = self.kv.smembers(&index_key).await?;
        Ok(member_window(members, count_limit, start))
    }

    /// Up to `count` records of the multi-index partition, newest first.
    ///
    /// `count < 0` reads the whole partition. An empty partition is an empty
    /// result, not an error.
    #[instrument(skip(self), fields(entity = %self.name()))]
    pub async fn get_by_multi_index_or_fail(
        &self,
        field: &str,
        value: &FieldValue,
        count: i64,
        start: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let uks = self.resolve_multi(field, value, count, start).await?;
        let mut records = Vec::with_capacity(uks.len());
        for uk in uks {
            records.push(self.get_or_fail(&FieldValue::Text(uk)).await?);
        }
        Ok(records)
    }

    pub async fn get_by_multi_index(
        &self,
        field: &str,
        value: &FieldValue,
        count: i64,
        start: usize,
    ) -> Result<Vec<Record>, StoreError> {
        Ok(optional(self.get_by_multi_index_or_fail(field, value, count, start).await)?
            .unwrap_or_default())
    }

    pub async fn lookup_or_fail(&self, lookup: &Lookup) -> Result<Vec<Record>, StoreError> {
        match lookup {
            Lookup::ByUniqueKey(uk) => Ok(vec![self.get_or_fail(uk).await?]),
            Lookup::ByUniqueIndex { field, value } => {
                Ok(vec![self.get_by_index_or_fail(field, value).await?])
            }
            Lookup::ByMultiIndex {
                field,
                value,
                count,
                start,
            } => {
                self.get_by_multi_index_or_fail(field, value, *count, *start)
                    .await
            }
        }
    }

    /// Like [`StoreControl::lookup_or_fail`], with a missing record as an empty result.
    pub async fn lookup(&self, lookup: &Lookup) -> Result<Vec<Record>, StoreError> {
        Ok(optional(self.lookup_or_fail(lookup).await)?.unwrap_or_default())
    }

    /// Handle bound to `uk`; nothing is read until it is used.
    pub fn instance(&self, uk: impl Into<FieldValue>) -> Instance<'_> {
        Instance::new(self, uk.into())
    }

    pub async fn instance_by_index(
        &self,
        field: &str,
        value: &FieldValue,
    ) -> Result<Instance<'_>, StoreError> {
        let uk = self.resolve_index(field, value).await?;
        Ok(Instance::new(self, FieldValue::Text(uk)))
    }

    pub async fn instances_by_multi_index(
        &self,
        field: &str,
        value: &FieldValue,
        count: i64,
        start: usize,
    ) -> Result<Vec<Instance<'_>>, StoreError> {
        let uks = self.resolve_multi(field, value, count, start).await?;
        Ok(uks
            .into_iter()
            .map(|uk| Instance::new(self, FieldValue::Text(uk)))
            .collect())
    }

    pub async fn instances(&self, lookup: &Lookup) -> Result<Vec<Instance<'_>>, StoreError> {
        match lookup {
            Lookup::ByUniqueKey(uk) => Ok(vec![Instance::new(self, uk.clone())]),
            Lookup::ByUniqueIndex { field, value } => {
                Ok(vec![self.instance_by_index(field, value).await?])
            }
            Lookup::ByMultiIndex {
                field,
                value,
                count,
                start,
            } => {
                self.instances_by_multi_index(field, value, *count, *start)
                    .await
            }
        }
    }

    /// Write index entries for the record behind `uk` from its cache hash.
    ///
    /// A record that is not cached is loaded first.
    pub async fn build_index(&self, uk: &FieldValue) -> Result<(), StoreError> {
        if !self.descriptor.has_indexes() {
            return Ok(());
        }
        let key = self.keys.primary(uk);
        if !self.kv.exists(&key).await? {
            self.load(uk).await?;
            return Ok(());
        }
        let hash = self.kv.hgetall(&key).await?;
        let uk_text = uk.to_cache_text();
        for field in self.descriptor.index_fields() {
            if let Some(value) = hash.get(field).filter(|value| !value.is_empty()) {
                self.kv.set(&self.keys.index_raw(field, value), &uk_text).await?;
            }
        }
        for field in self.descriptor.multi_index_fields() {
            if let Some(value) = hash.get(field).filter(|value| !value.is_empty()) {
                self.kv.sadd(&self.keys.index_raw(field, value), &uk_text).await?;
            }
        }
        Ok(())
    }

    /// Write index entries for `record`; absent and null fields are skipped.
    pub async fn build_index_for(&self, record: &Record) -> Result<(), StoreError> {
        if !self.descriptor.has_indexes() {
            return Ok(());
        }
        let uk = self.record_uk(record)?.to_cache_text();
        for field in self.descriptor.index_fields() {
            if let Some(value) = record.get(field).filter(|value| !value.is_null()) {
                self.kv.set(&self.keys.index(field, value), &uk).await?;
            }
        }
        for field in self.descriptor.multi_index_fields() {
            if let Some(value) = record.get(field).filter(|value| !value.is_null()) {
                self.kv.sadd(&self.keys.index(field, value), &uk).await?;
            }
        }
        Ok(())
    }

    /// Remove index entries of the cached record behind `uk`.
    ///
    /// Reads the raw cache hash, so the record must not have been overwritten
    /// yet. A record that is not cached has nothing to remove.
    pub async fn del_index(&self, uk: &FieldValue) -> Result<(), StoreError> {
        if !self.descriptor.has_indexes() {
            return Ok(());
        }
        let hash = self.kv.hgetall(&self.keys.primary(uk)).await?;
        if hash.is_empty() {
            return Ok(());
        }
        let uk_text = uk.to_cache_text();
        let mut doomed = Vec::new();
        for field in self.descriptor.index_fields() {
            if let Some(value) = hash.get(field).filter(|value| !value.is_empty()) {
                doomed.push(self.keys.index_raw(field, value));
            }
        }
        for field in self.descriptor.multi_index_fields() {
            if let Some(value) = hash.get(field).filter(|value| !value.is_empty()) {
                let key = self.keys.index_raw(field, value);
                self.kv.srem(&key, &uk_text).await?;
                if self.kv.scard(&key).await? == 0 {
                    doomed.push(key);
                }
            }
        }
        if !doomed.is_empty() {
            self.kv.del(&doomed).await?;
        }
        Ok(())
    }

    /// Upsert a record that already has a unique key.
    ///
    /// Fields missing from `record` keep their cached values, and the indexes
    /// are rebuilt from the merged hash. `sync_once` forces a blocking
    /// backing-store write for this call.
    #[instrument(skip(self, record), fields(entity = %self.name()))]
    pub async fn save(&self, record: &Record, sync_once: bool) -> Result<PendingWrite, StoreError> {
        let uk = self.record_uk(record).map_err(|_| {
            StoreError::validation(format!(
                "save needs a `{}` value; use push for new records",
                self.descriptor.unique_key()
            ))
        })?;
        self.del_index(&uk).await?;
        self.write_hash(record).await?;
        self.build_index(&uk).await?;
        self.writes
            .submit(WriteOp::Save(record.clone()), self.blocking_writes(sync_once))
            .await
    }

    /// Insert a new record through the backing store, then cache it.
    ///
    /// Always blocks: the unique key is assigned by the backing store.
    #[instrument(skip(self, record), fields(entity = %self.name()))]
    pub async fn push(&self, record: &Record) -> Result<Record, StoreError> {
        let saved = self
            .repo
            .save(record)
            .await
            .map_err(|err| StoreError::repo(self.name(), err, || "push".to_string()))?;
        let uk = self.record_uk(&saved)?;
        self.store_in_cache(&saved).await?;

        let all = self.keys.all_keys();
        if self.kv.exists(&all).await? {
            self.kv.lpush(&all, &[uk.to_cache_text()]).await?;
        } else {
            self.index_array(-1, 0).await?;
        }
        Ok(saved)
    }

    /// Drop the record from the cache and the backing store.
    #[instrument(skip(self), fields(entity = %self.name()))]
    pub async fn del(&self, uk: &FieldValue, sync_once: bool) -> Result<PendingWrite, StoreError> {
        let filter = self.uk_filter(uk)?;
        self.del_index(uk).await?;
        self.kv.del(&[self.keys.primary(uk)]).await?;
        self.kv
            .lrem(&self.keys.all_keys(), 0, &uk.to_cache_text())
            .await?;
        self.writes
            .submit(WriteOp::Remove { filter }, self.blocking_writes(sync_once))
            .await
    }

    /// Slice `[start, stop]` of the all-keys list, materializing it on first use.
    ///
    /// Negative positions count from the tail; `(-1, 0)` is every key.
    #[instrument(skip(self), fields(entity = %self.name()))]
    pub async fn index_array(&self, stop: i64, start: i64) -> Result<Vec<String>, StoreError> {
        let all = self.keys.all_keys();
        if !self.kv.exists(&all).await? {
            self.materialize_all().await?;
        }
        Ok(self.kv.lrange(&all, start, stop).await?)
    }

    async fn materialize_all(&self) -> Result<(), StoreError> {
        let records = self.find_many(&Filter::all()).await?;
        let mut uks = Vec::with_capacity(records.len());
        for record in &records {
            self.store_in_cache(record).await?;
            uks.push(self.record_uk(record)?.to_cache_text());
        }
        if !uks.is_empty() {
            self.kv.lpush(&self.keys.all_keys(), &uks).await?;
        }
        count(METRIC_LIST_MATERIALIZE, self.name());
        info!(entity = %self.name(), records = uks.len(), "all-keys list materialized");
        Ok(())
    }

    /// Records in positions `[start, stop]` of the all-keys list.
    pub async fn range(&self, stop: i64, start: i64) -> Result<Vec<Record>, StoreError> {
        let uks = self.index_array(stop, start).await?;
        let mut records = Vec::with_capacity(uks.len());
        for uk in uks {
            records.push(self.get_or_fail(&FieldValue::Text(uk)).await?);
        }
        Ok(records)
    }

    pub async fn all(&self) -> Result<Vec<Record>, StoreError> {
        self.range(-1, 0).await
    }
}

fn describe(filter: &Filter) -> String {
    if filter.is_empty() {
        return "any row".to_string();
    }
    filter
        .conditions()
        .iter()
        .map(|(field, value)| format!("{field} = {value}"))
        .collect::<Vec<_>>()
        .join(" and ")
}
