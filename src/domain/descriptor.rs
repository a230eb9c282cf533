//! Per-entity caching and indexing policy.
//!
//! A descriptor is declared once per entity type and is immutable after
//! [`EntityDescriptorBuilder::build`] validates it.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use super::coercion::Coercion;
use super::error::DomainError;
use super::filter::Filter;
use super::value::FieldValue;

const DEFAULT_UNIQUE_KEY: &str = "id";

/// Whether writes block on the backing store or are detached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Write-through: the caller waits for the backing store.
    Sync,
    /// Write-back: the backing-store write runs as a detached task.
    #[default]
    Async,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Sync => "sync",
            SyncMode::Async => "async",
        }
    }
}

/// Maps a unique-key value to the backing-store filter selecting its row.
pub type QueryMapping = Arc<dyn Fn(&FieldValue) -> Filter + Send + Sync>;

#[derive(Clone)]
pub struct EntityDescriptor {
    name: String,
    table: String,
    unique_key: String,
    index_fields: Vec<String>,
    multi_index_fields: Vec<String>,
    cache_fields: Vec<String>,
    sync_mode: SyncMode,
    query_mapping: Option<QueryMapping>,
    coercion: Coercion,
}

impl EntityDescriptor {
    pub fn builder(name: impl Into<String>) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing-store table; defaults to the entity name.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    pub fn index_fields(&self) -> &[String] {
        &self.index_fields
    }

    pub fn multi_index_fields(&self) -> &[String] {
        &self.multi_index_fields
    }

    /// Empty means every field is cached.
    pub fn cache_fields(&self) -> &[String] {
        &self.cache_fields
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn coercion(&self) -> &Coercion {
        &self.coercion
    }

    pub fn is_index_field(&self, field: &str) -> bool {
        self.index_fields.iter().any(|f| f == field)
    }

    pub fn is_multi_index_field(&self, field: &str) -> bool {
        self.multi_index_fields.iter().any(|f| f == field)
    }

    /// Unique or multi index.
    pub fn is_indexed(&self, field: &str) -> bool {
        self.is_index_field(field) || self.is_multi_index_field(field)
    }

    pub fn has_indexes(&self) -> bool {
        !self.index_fields.is_empty() || !self.multi_index_fields.is_empty()
    }

    pub fn is_cached(&self, field: &str) -> bool {
        self.cache_fields.is_empty() || self.cache_fields.iter().any(|f| f == field)
    }

    /// Filter selecting the row behind a unique key.
    pub fn key_filter(&self, uk: &FieldValue) -> Filter {
        match &self.query_mapping {
            Some(mapping) => mapping(uk),
            None => Filter::eq(self.unique_key.clone(), uk.clone()),
        }
    }

    /// Re-check the construction invariants.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("entity name must not be empty"));
        }
        if self.unique_key.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "entity `{}` has an empty unique key",
                self.name
            )));
        }
        if let Some(field) = self
            .index_fields
            .iter()
            .find(|field| self.multi_index_fields.contains(field))
        {
            return Err(DomainError::validation(format!(
                "field `{field}` of `{}` is declared as both a unique index and a multi index",
                self.name
            )));
        }
        if !self.cache_fields.is_empty() {
            if !self.cache_fields.contains(&self.unique_key) {
                return Err(DomainError::validation(format!(
                    "unique key `{}` of `{}` is missing from the cached fields",
                    self.unique_key, self.name
                )));
            }
            for field in self.index_fields.iter().chain(&self.multi_index_fields) {
                if !self.cache_fields.contains(field) {
                    return Err(DomainError::validation(format!(
                        "index field `{field}` of `{}` is missing from the cached fields",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("unique_key", &self.unique_key)
            .field("index_fields", &self.index_fields)
            .field("multi_index_fields", &self.multi_index_fields)
            .field("cache_fields", &self.cache_fields)
            .field("sync_mode", &self.sync_mode)
            .field("custom_query_mapping", &self.query_mapping.is_some())
            .field("coercion", &self.coercion)
            .finish()
    }
}

pub struct EntityDescriptorBuilder {
    name: String,
    table: Option<String>,
    unique_key: Option<String>,
    index_fields: Vec<String>,
    multi_index_fields: Vec<String>,
    cache_fields: Vec<String>,
    sync_mode: SyncMode,
    query_mapping: Option<QueryMapping>,
    coercion: Coercion,
}

impl EntityDescriptorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            unique_key: None,
            index_fields: Vec::new(),
            multi_index_fields: Vec::new(),
            cache_fields: Vec::new(),
            sync_mode: SyncMode::default(),
            query_mapping: None,
            coercion: Coercion::default(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn unique_key(mut self, field: impl Into<String>) -> Self {
        self.unique_key = Some(field.into());
        self
    }

    pub fn index(mut self, field: impl Into<String>) -> Self {
        push_unique(&mut self.index_fields, field.into());
        self
    }

    pub fn multi_index(mut self, field: impl Into<String>) -> Self {
        push_unique(&mut self.multi_index_fields, field.into());
        self
    }

    pub fn cache_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            push_unique(&mut self.cache_fields, field.into());
        }
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Custom unique-key → filter mapping for composite or natural keys.
    pub fn query_mapping<F>(mut self, mapping: F) -> Self
    where
        F: Fn(&FieldValue) -> Filter + Send + Sync + 'static,
    {
        self.query_mapping = Some(Arc::new(mapping));
        self
    }

    pub fn coercion(mut self, coercion: Coercion) -> Self {
        self.coercion = coercion;
        self
    }

    pub fn build(self) -> Result<EntityDescriptor, DomainError> {
        let unique_key = self
            .unique_key
            .unwrap_or_else(|| DEFAULT_UNIQUE_KEY.to_string());
        let mut cache_fields = self.cache_fields;
        if !cache_fields.is_empty() {
            push_unique(&mut cache_fields, unique_key.clone());
        }

        let descriptor = EntityDescriptor {
            table: self.table.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            unique_key,
            index_fields: self.index_fields,
            multi_index_fields: self.multi_index_fields,
            cache_fields,
            sync_mode: self.sync_mode,
            query_mapping: self.query_mapping,
            coercion: self.coercion,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

fn push_unique(fields: &mut Vec<String>, field: String) {
    if !fields.contains(&field) {
        fields.push(field);
    }
}
