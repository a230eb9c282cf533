//! In-process [`KvClient`] with Redis data-type semantics.
//!
//! Used by tests and by the CLI when no external cache is wired in. Sets keep
//! insertion order so "newest first" reads are exact rather than approximate.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::application::kv::{KvClient, KvError};

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::memory";

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Hash(BTreeMap<String, String>),
    List(VecDeque<String>),
    Set(Vec<String>),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Str(_) => false,
            Entry::Hash(hash) => hash.is_empty(),
            Entry::List(list) => list.is_empty(),
            Entry::Set(set) => set.is_empty(),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str) -> KvError {
    KvError::WrongType {
        key: key.to_string(),
        expected,
    }
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = rw_read(&self.entries, SOURCE, "keys")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn key_count(&self) -> usize {
        rw_read(&self.entries, SOURCE, "key_count").len()
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    fn with_hash<R>(
        &self,
        key: &str,
        op: &'static str,
        apply: impl FnOnce(&mut BTreeMap<String, String>) -> Result<R, KvError>,
    ) -> Result<R, KvError> {
        let mut entries = rw_write(&self.entries, SOURCE, op);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()));
        let result = match entry {
            Entry::Hash(hash) => apply(hash),
            _ => return Err(wrong_type(key, "hash")),
        };
        if entry.is_empty() {
            entries.remove(key);
        }
        result
    }
}

fn hash_number<T: std::str::FromStr>(
    hash: &BTreeMap<String, String>,
    key: &str,
    field: &str,
    zero: T,
) -> Result<T, KvError> {
    match hash.get(field) {
        None => Ok(zero),
        Some(raw) => raw.parse().map_err(|_| KvError::NotNumeric {
            key: key.to_string(),
            field: field.to_string(),
        }),
    }
}

/// Resolve a Redis-style inclusive range against `len`.
fn list_window(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(rw_read(&self.entries, SOURCE, "exists").contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match rw_read(&self.entries, SOURCE, "get").get(key) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        rw_write(&self.entries, SOURCE, "set")
            .insert(key.to_string(), Entry::Str(value.to_string()));
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, KvError> {
        match rw_read(&self.entries, SOURCE, "hgetall").get(key) {
            None => Ok(BTreeMap::new()),
            Some(Entry::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        self.with_hash(key, "hset_multiple", |hash| {
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            Ok(())
        })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError> {
        self.with_hash(key, "hincr_by", |hash| {
            let current: i64 = hash_number(hash, key, field, 0)?;
            let next = current
                .checked_add(delta)
                .ok_or_else(|| KvError::backend("increment or decrement would overflow"))?;
            hash.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64, KvError> {
        self.with_hash(key, "hincr_by_float", |hash| {
            let current: f64 = hash_number(hash, key, field, 0.0)?;
            let next = current + delta;
            if !next.is_finite() {
                return Err(KvError::backend("increment would produce NaN or Infinity"));
            }
            hash.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, KvError> {
        let mut entries = rw_write(&self.entries, SOURCE, "lpush");
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()));
        match entry {
            Entry::List(list) => {
                for value in values {
                    list.push_front(value.clone());
                }
                let len = list.len() as u64;
                if list.is_empty() {
                    entries.remove(key);
                }
                Ok(len)
            }
            _ => Err(wrong_type(key, "list")),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        match rw_read(&self.entries, SOURCE, "lrange").get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List(list)) => Ok(list_window(list.len(), start, stop)
                .map(|(from, to)| list.range(from..=to).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, KvError> {
        let mut entries = rw_write(&self.entries, SOURCE, "lrem");
        let list = match entries.get_mut(key) {
            None => return Ok(0),
            Some(Entry::List(list)) => list,
            Some(_) => return Err(wrong_type(key, "list")),
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut positions: Vec<usize> = list
            .iter()
            .enumerate()
            .filter(|(_, item)| item.as_str() == value)
            .map(|(index, _)| index)
            .collect();
        if count < 0 {
            positions.reverse();
        }
        positions.truncate(limit);
        positions.sort_unstable_by(|a, b| b.cmp(a));
        for index in &positions {
            list.remove(*index);
        }
        if list.is_empty() {
            entries.remove(key);
        }
        Ok(positions.len() as u64)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut entries = rw_write(&self.entries, SOURCE, "sadd");
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(Vec::new()));
        match entry {
            Entry::Set(set) => {
                if set.iter().any(|existing| existing == member) {
                    return Ok(false);
                }
                set.push(member.to_string());
                Ok(true)
            }
            _ => Err(wrong_type(key, "set")),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut entries = rw_write(&self.entries, SOURCE, "srem");
        let set = match entries.get_mut(key) {
            None => return Ok(false),
            Some(Entry::Set(set)) => set,
            Some(_) => return Err(wrong_type(key, "set")),
        };
        let before = set.len();
        set.retain(|existing| existing != member);
        let removed = set.len() != before;
        if set.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        match rw_read(&self.entries, SOURCE, "smembers").get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.clone()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    async fn scard(&self, key: &str) -> Result<u64, KvError> {
        match rw_read(&self.entries, SOURCE, "scard").get(key) {
            None => Ok(0),
            Some(Entry::Set(set)) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        let mut entries = rw_write(&self.entries, SOURCE, "del");
        Ok(keys
            .iter()
            .filter(|key| entries.remove(key.as_str()).is_some())
            .count() as u64)
    }
}
