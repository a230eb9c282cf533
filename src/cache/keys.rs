//! Cache key definitions.
//!
//! Key formats are shared with other processes reading the same cache and
//! must stay byte-for-byte stable:
//!
//! | key | format |
//! |---|---|
//! | primary hash | `{entity}:{uk}` |
//! | all-keys list | `{entity}All` |
//! | unique / multi index | `{entity}-{field}:{value}` |

use std::fmt;

use crate::domain::value::FieldValue;

/// One cache key of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Field hash of one record.
    Primary { entity: String, uk: String },
    /// List of every known unique key.
    AllKeys { entity: String },
    /// Unique index (string) or multi index (set) entry.
    Index {
        entity: String,
        field: String,
        value: String,
    },
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Primary { entity, uk } => write!(f, "{entity}:{uk}"),
            CacheKey::AllKeys { entity } => write!(f, "{entity}All"),
            CacheKey::Index {
                entity,
                field,
                value,
            } => write!(f, "{entity}-{field}:{value}"),
        }
    }
}

/// Deterministic key builders for one entity name.
#[derive(Debug, Clone)]
pub struct KeySpace {
    entity: String,
}

impl KeySpace {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn primary(&self, uk: &FieldValue) -> String {
        self.primary_raw(&uk.to_cache_text())
    }

    pub fn primary_raw(&self, uk: &str) -> String {
        CacheKey::Primary {
            entity: self.entity.clone(),
            uk: uk.to_string(),
        }
        .to_string()
    }

    pub fn all_keys(&self) -> String {
        CacheKey::AllKeys {
            entity: self.entity.clone(),
        }
        .to_string()
    }

    pub fn index(&self, field: &str, value: &FieldValue) -> String {
        self.index_raw(field, &value.to_cache_text())
    }

    pub fn index_raw(&self, field: &str, value: &str) -> String {
        CacheKey::Index {
            entity: self.entity.clone(),
            field: field.to_string(),
            value: value.to_string(),
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats_are_stable() {
        let keys = KeySpace::new("User");
        assert_eq!(keys.primary(&FieldValue::Int(1)), "User:1");
        assert_eq!(keys.all_keys(), "UserAll");
        assert_eq!(
            keys.index("email", &FieldValue::from("a@x.com")),
            "User-email:a@x.com"
        );
        assert_eq!(keys.index("groupId", &FieldValue::Int(10)), "User-groupId:10");
    }

    #[test]
    fn text_and_native_keys_agree() {
        let keys = KeySpace::new("User");
        assert_eq!(keys.primary(&FieldValue::from("1")), keys.primary(&FieldValue::Int(1)));
    }

    #[test]
    fn cache_key_equality() {
        let key1 = CacheKey::AllKeys {
            entity: "User".to_string(),
        };
        let key2 = CacheKey::AllKeys {
            entity: "User".to_string(),
        };
        assert_eq!(key1, key2);
        assert_ne!(
            key1,
            CacheKey::AllKeys {
                entity: "Group".to_string()
            }
        );
    }
}
