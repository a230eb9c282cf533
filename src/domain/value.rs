//! Field values and records as they travel between the backing store, the
//! key-value cache, and callers.
//!
//! The cache stores every field as text; [`FieldValue::to_cache_text`] is the
//! single encoding used for hash fields, index keys, and list members.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// A single native field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Uuid(Uuid),
    #[serde(with = "time::serde::rfc3339")]
    Timestamp(OffsetDateTime),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text form written to the cache. `Null` encodes as the empty string.
    pub fn to_cache_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Uuid(value) => value.to_string(),
            // Rfc3339 formatting only fails for offsets outside ±23:59:59.
            Self::Timestamp(value) => value
                .format(&Rfc3339)
                .unwrap_or_else(|_| value.unix_timestamp().to_string()),
            Self::Text(value) => value.clone(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Text(value) => value.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Int(value) => Some(*value as f64),
            Self::Text(value) => value.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cache_text())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<OffsetDateTime> for FieldValue {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// An ordered field → value snapshot of one entity row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, FieldValue>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(field, value)| (field.as_str(), value))
    }

    /// Overwrite fields present in `other`, keeping everything else.
    pub fn merge(&mut self, other: &Record) {
        for (field, value) in other.iter() {
            self.0.insert(field.to_string(), value.clone());
        }
    }

    /// Keep only `fields`; an empty slice keeps every field.
    pub fn project(&self, fields: &[String]) -> Record {
        if fields.is_empty() {
            return self.clone();
        }
        Record(
            self.0
                .iter()
                .filter(|(field, _)| fields.contains(field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
        )
    }

    /// Field/value pairs in cache text form.
    pub fn to_cache_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(field, value)| (field.clone(), value.to_cache_text()))
            .collect()
    }

    /// Rebuild a record from a cache hash with every value as text.
    pub fn from_cache_hash(hash: BTreeMap<String, String>) -> Self {
        Record(
            hash.into_iter()
                .map(|(field, value)| (field, FieldValue::Text(value)))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Record(
            iter.into_iter()
                .map(|(field, value)| (field.into(), value.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Record {
    type Item = (String, FieldValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
