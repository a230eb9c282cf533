//! Equality filters handed to backing-store repositories.

use super::value::{FieldValue, Record};

/// Conjunction of `field = value` conditions. An empty filter selects every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, FieldValue)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::all().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, FieldValue)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Compares in cache text form, so `Int(1)` matches a key read back as `"1"`.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            record
                .get(field)
                .is_some_and(|actual| actual.to_cache_text() == expected.to_cache_text())
        })
    }
}
