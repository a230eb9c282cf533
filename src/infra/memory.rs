//! In-process backing store.
//!
//! Rows live in insertion order per table. Rows saved without a unique key
//! get the next integer key, like a serial primary key column. Saving an
//! existing key only overwrites the columns the record carries.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::application::repos::{EntityRepo, RepoError, RepoProvider};
use crate::cache::lock::{rw_read, rw_write};
use crate::domain::descriptor::EntityDescriptor;
use crate::domain::filter::Filter;
use crate::domain::value::{FieldValue, Record};

const SOURCE: &str = "infra::memory";

pub struct MemoryRepo {
    unique_key: String,
    rows: RwLock<Vec<Record>>,
    next_key: AtomicI64,
    scans: AtomicUsize,
    writes: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl MemoryRepo {
    pub fn new(unique_key: impl Into<String>) -> Self {
        Self {
            unique_key: unique_key.into(),
            rows: RwLock::new(Vec::new()),
            next_key: AtomicI64::new(1),
            scans: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Insert rows directly, bypassing write accounting.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            let record = self.assign_key(record);
            self.upsert(record);
        }
    }

    pub fn rows(&self) -> Vec<Record> {
        rw_read(&self.rows, SOURCE, "rows").clone()
    }

    /// Number of `find_many` calls served.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Number of successful `save`/`patch`/`remove` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `count` writes fail with a persistence error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Result<(), RepoError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match injected {
            Ok(_) => Err(RepoError::from_persistence("injected write failure")),
            Err(_) => Ok(()),
        }
    }

    fn key_text(&self, record: &Record) -> Option<String> {
        record
            .get(&self.unique_key)
            .filter(|value| !value.is_null())
            .map(FieldValue::to_cache_text)
    }

    fn assign_key(&self, mut record: Record) -> Record {
        match record.get(&self.unique_key).and_then(FieldValue::as_i64) {
            Some(existing) => {
                self.next_key.fetch_max(existing + 1, Ordering::SeqCst);
            }
            None if self.key_text(&record).is_none() => {
                let key = self.next_key.fetch_add(1, Ordering::SeqCst);
                record.insert(self.unique_key.clone(), key);
            }
            None => {}
        }
        record
    }

    /// Merge into the row with the same key, or append; returns the stored row.
    fn upsert(&self, record: Record) -> Record {
        let key = self.key_text(&record);
        let mut rows = rw_write(&self.rows, SOURCE, "upsert");
        match rows.iter_mut().find(|row| self.key_text(row) == key) {
            Some(row) => {
                row.merge(&record);
                row.clone()
            }
            None => {
                rows.push(record.clone());
                record
            }
        }
    }
}

#[async_trait]
impl EntityRepo for MemoryRepo {
    async fn find_many(&self, filter: &Filter) -> Result<Vec<Record>, RepoError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(rw_read(&self.rows, SOURCE, "find_many")
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, RepoError> {
        Ok(rw_read(&self.rows, SOURCE, "find_one")
            .iter()
            .find(|row| filter.matches(row))
            .cloned())
    }

    async fn save(&self, record: &Record) -> Result<Record, RepoError> {
        self.take_injected_failure()?;
        let record = self.assign_key(record.clone());
        let stored = self.upsert(record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn patch(&self, filter: &Filter, fields: &Record) -> Result<(), RepoError> {
        self.take_injected_failure()?;
        let mut rows = rw_write(&self.rows, SOURCE, "patch");
        let row = rows
            .iter_mut()
            .find(|row| filter.matches(row))
            .ok_or(RepoError::NotFound)?;
        row.merge(fields);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, record: &Record) -> Result<(), RepoError> {
        self.take_injected_failure()?;
        let key = self
            .key_text(record)
            .ok_or_else(|| RepoError::invalid_input("cannot remove a row without a key"))?;
        let mut rows = rw_write(&self.rows, SOURCE, "remove");
        let before = rows.len();
        rows.retain(|row| self.key_text(row).as_deref() != Some(key.as_str()));
        if rows.len() == before {
            return Err(RepoError::NotFound);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One [`MemoryRepo`] per table, created on first use.
#[derive(Default)]
pub struct MemoryRepositories {
    tables: DashMap<String, Arc<MemoryRepo>>,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// The repository for `table`, creating it with `unique_key` if needed.
    pub fn table(&self, table: &str, unique_key: &str) -> Arc<MemoryRepo> {
        self.tables
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(MemoryRepo::new(unique_key)))
            .clone()
    }
}

impl RepoProvider for MemoryRepositories {
    fn repository(&self, descriptor: &EntityDescriptor) -> Arc<dyn EntityRepo> {
        self.table(descriptor.table(), descriptor.unique_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_assigns_serial_keys() {
        let repo = MemoryRepo::new("id");
        let first = repo
            .save(&Record::new().with("name", "A"))
            .await
            .expect("save");
        let second = repo
            .save(&Record::new().with("name", "B"))
            .await
            .expect("save");

        assert_eq!(first.get("id"), Some(&FieldValue::Int(1)));
        assert_eq!(second.get("id"), Some(&FieldValue::Int(2)));
    }

    #[tokio::test]
    async fn explicit_keys_advance_the_sequence() {
        let repo = MemoryRepo::new("id");
        repo.save(&Record::new().with("id", 7)).await.expect("save");
        let next = repo.save(&Record::new()).await.expect("save");
        assert_eq!(next.get("id"), Some(&FieldValue::Int(8)));
    }

    #[tokio::test]
    async fn save_updates_in_place() {
        let repo = MemoryRepo::new("id");
        repo.seed([Record::new()
            .with("id", 1)
            .with("name", "A")
            .with("email", "a@x")]);
        let stored = repo
            .save(&Record::new().with("id", 1).with("name", "B"))
            .await
            .expect("save");

        let rows = repo.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&FieldValue::from("B")));
        assert_eq!(rows[0].get("email"), Some(&FieldValue::from("a@x")));
        assert_eq!(stored, rows[0]);
    }

    #[tokio::test]
    async fn patch_touches_only_the_given_columns() {
        let repo = MemoryRepo::new("id");
        repo.seed([Record::new().with("id", 1).with("name", "A").with("age", 20)]);

        repo.patch(&Filter::eq("id", 1), &Record::new().with("age", 21))
            .await
            .expect("patch");

        assert_eq!(
            repo.rows(),
            vec![Record::new().with("id", 1).with("name", "A").with("age", 21)]
        );
        assert_eq!(repo.write_count(), 1);
        let err = repo
            .patch(&Filter::eq("id", 2), &Record::new().with("age", 1))
            .await
            .expect_err("no such row");
        assert!(matches!(err, RepoError::NotFound));
    }

    #[tokio::test]
    async fn remove_missing_row_is_not_found() {
        let repo = MemoryRepo::new("id");
        let err = repo
            .remove(&Record::new().with("id", 3))
            .await
            .expect_err("nothing to remove");
        assert!(matches!(err, RepoError::NotFound));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let repo = MemoryRepo::new("id");
        repo.fail_next_writes(1);
        assert!(repo.save(&Record::new()).await.is_err());
        assert!(repo.save(&Record::new()).await.is_ok());
        assert_eq!(repo.write_count(), 1);
    }

    #[tokio::test]
    async fn find_one_or_fail_maps_missing_rows() {
        let repo = MemoryRepo::new("id");
        let err = repo
            .find_one_or_fail(&Filter::eq("id", 1))
            .await
            .expect_err("missing");
        assert!(matches!(err, RepoError::NotFound));
    }

    #[test]
    fn provider_reuses_tables() {
        let repos = MemoryRepositories::new();
        let first = repos.table("users", "id");
        let second = repos.table("users", "id");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
