//! In-process cache backend.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::trace;

use crate::util::lock::{rw_read, rw_write};

use super::{Cache, CacheEntry, CacheError, parse_config, record_expired, record_lookup};

const SOURCE: &str = "cache::memory";
const BACKEND: &str = "memory";

#[derive(Debug, Default, Deserialize)]
struct MemoryCacheConfig {}

/// Key → entry table behind a single reader/writer lock.
///
/// Expired entries are only removed when they are looked up again or on
/// [`Cache::clear_all`]; an entry nobody reads stays in memory.
#[derive(Debug, Default)]
pub struct MemoryCache {
    items: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet observed.
    pub fn len(&self) -> usize {
        rw_read(&self.items, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key`, evicting it when the read lock observes an expired entry.
    fn lookup(&self, key: &str) -> Option<Value> {
        let now = OffsetDateTime::now_utc();
        {
            let items = rw_read(&self.items, SOURCE, "lookup");
            match items.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.content.clone()),
                Some(_) => {}
            }
        }

        let mut items = rw_write(&self.items, SOURCE, "lookup.evict");
        // A concurrent put may have refreshed the entry between the two locks.
        if let Some(entry) = items.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.content.clone());
            }
            items.remove(key);
            record_expired(BACKEND);
            trace!(target = "gantry::cache", backend = BACKEND, key, "evicted expired entry");
        }
        None
    }
}

impl Cache for MemoryCache {
    fn init(&mut self, config: &str) -> Result<(), CacheError> {
        parse_config::<MemoryCacheConfig>(config).map(|_| ())
    }

    fn get(&self, key: &str) -> Option<Value> {
        let value = self.lookup(key);
        record_lookup(BACKEND, value.is_some());
        value
    }

    fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry::new(value, ttl);
        rw_write(&self.items, SOURCE, "put").insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        rw_write(&self.items, SOURCE, "delete").remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    fn clear_all(&self) -> Result<(), CacheError> {
        rw_write(&self.items, SOURCE, "clear_all").clear();
        Ok(())
    }
}
