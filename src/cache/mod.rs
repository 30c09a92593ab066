//! Gantry Cache System
//!
//! A small pluggable cache contract with two backends:
//!
//! - **memory**: in-process table guarded by one reader/writer lock
//! - **file**: content-addressed files under a cache directory
//!
//! Both backends expire lazily: an entry is checked against its expiry when it
//! is read, and deleted instead of returned once the deadline has passed.
//! Nothing sweeps in the background.
//!
//! Backends are constructed by name through a [`CacheAdapterRegistry`]:
//!
//! ```toml
//! [cache]
//! adapter = "file"
//! config = '{"path": "var/cache", "extension": ".bin"}'
//! ```

mod file;
mod memory;
mod registry;

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

pub use file::{FileCache, FileCacheConfig};
pub use memory::MemoryCache;
pub use registry::{AdapterFactory, CacheAdapterRegistry};

/// Errors surfaced by cache backends and the adapter registry.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache configuration error: {0}")]
    Config(String),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache: unknown adapter `{0}`")]
    UnknownAdapter(String),
    #[error("cache register `{name}`: {reason}")]
    DuplicateAdapter { name: String, reason: &'static str },
}

impl CacheError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// The contract every cache backend implements.
///
/// `get` and `exists` never fail: storage problems degrade to a miss and are
/// logged by the backend.
pub trait Cache: Send + Sync {
    /// Backend-specific setup from a JSON configuration string (may be empty).
    fn init(&mut self, config: &str) -> Result<(), CacheError>;

    /// Cached value for `key`, if present and unexpired.
    fn get(&self, key: &str) -> Option<Value>;

    /// Independent lookups, returned in the order of `keys`.
    fn get_multi(&self, keys: &[&str]) -> Vec<Option<Value>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Store `value` under `key` until `now + ttl`, replacing any previous entry.
    fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Remove `key`; removing an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Same expiry rules as [`Cache::get`], without returning the value.
    fn exists(&self, key: &str) -> bool;

    /// Remove every entry held by the backend.
    fn clear_all(&self) -> Result<(), CacheError>;
}

/// Typed convenience wrappers over the JSON-valued [`Cache`] contract.
pub trait CacheExt: Cache {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    fn put_as<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let value = serde_json::to_value(value)?;
        self.put(key, value, ttl)
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// A stored value together with the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: Value,
    #[serde(with = "unix_millis")]
    pub expires_at: OffsetDateTime,
}

impl CacheEntry {
    pub fn new(content: Value, ttl: Duration) -> Self {
        let ttl = time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX);
        Self {
            content,
            expires_at: OffsetDateTime::now_utc().saturating_add(ttl),
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at < now
    }
}

/// Parse an adapter configuration string; empty input yields the defaults.
pub(crate) fn parse_config<T>(config: &str) -> Result<T, CacheError>
where
    T: DeserializeOwned + Default,
{
    if config.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(config).map_err(|err| CacheError::config(err.to_string()))
}

pub(crate) fn record_lookup(backend: &'static str, hit: bool) {
    if hit {
        metrics::counter!("gantry_cache_hit_total", "backend" => backend).increment(1);
    } else {
        metrics::counter!("gantry_cache_miss_total", "backend" => backend).increment(1);
    }
}

pub(crate) fn record_expired(backend: &'static str) {
    metrics::counter!("gantry_cache_expired_total", "backend" => backend).increment(1);
}

mod unix_millis {
    use super::*;

    pub fn serialize<S: Serializer>(at: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = at.unix_timestamp_nanos() / 1_000_000;
        serializer.serialize_i64(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entry_expires_after_deadline() {
        let entry = CacheEntry::new(json!("v"), Duration::from_secs(10));
        let now = OffsetDateTime::now_utc();
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + time::Duration::seconds(11)));
    }

    #[test]
    fn huge_ttl_saturates_instead_of_overflowing() {
        let entry = CacheEntry::new(json!(1), Duration::MAX);
        assert!(!entry.is_expired(OffsetDateTime::now_utc()));
    }

    #[test]
    fn entry_serializes_expiry_as_unix_millis() {
        let entry = CacheEntry {
            content: json!({"a": 1}),
            expires_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("valid ts"),
        };
        let encoded = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(encoded["expires_at"], json!(1_700_000_000_000_i64));

        let decoded: CacheEntry = serde_json::from_value(encoded).expect("deserialize");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn empty_config_yields_defaults() {
        let parsed: FileCacheConfig = parse_config("  ").expect("defaults");
        assert_eq!(parsed.extension, ".bin");
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let err = parse_config::<FileCacheConfig>("{not json").expect_err("malformed");
        assert!(matches!(err, CacheError::Config(_)));
    }
}
