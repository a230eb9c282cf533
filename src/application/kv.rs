//! Key-value cache client contract.
//!
//! Mirrors the subset of Redis commands the store relies on: strings, hashes,
//! lists, and sets. Implementations must delete an aggregate key once it
//! becomes empty, as Redis does.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key `{key}` holds the wrong kind of value (expected {expected})")]
    WrongType { key: String, expected: &'static str },
    #[error("hash field `{field}` of `{key}` is not a number")]
    NotNumeric { key: String, field: String },
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl KvError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

#[async_trait]
pub trait KvClient: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Empty map when the key is absent.
    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, KvError>;

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError>;

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64, KvError>;

    /// Prepends each value in turn; returns the new length.
    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, KvError>;

    /// Inclusive range; negative indices count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError>;

    /// `count == 0` removes every occurrence.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, KvError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;

    async fn scard(&self, key: &str) -> Result<u64, KvError>;

    /// Returns how many of `keys` existed.
    async fn del(&self, keys: &[String]) -> Result<u64, KvError>;
}
