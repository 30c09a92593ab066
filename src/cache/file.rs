//! Filesystem cache backend.
//!
//! Every key maps to `<path>/<hex(sha256(key))><extension>` holding a JSON
//! encoded [`CacheEntry`]. Entries that fail to decode are treated as misses
//! and removed.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{Cache, CacheEntry, CacheError, parse_config, record_expired, record_lookup};

const BACKEND: &str = "file";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileCacheConfig {
    pub path: PathBuf,
    pub extension: String,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cache"),
            extension: ".bin".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
    extension: String,
}

impl Default for FileCache {
    fn default() -> Self {
        Self::from_config(FileCacheConfig::default())
    }
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_config(config: FileCacheConfig) -> Self {
        Self {
            path: config.path,
            extension: config.extension,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.path
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.path
            .join(format!("{}{}", hex::encode(digest), self.extension))
    }

    /// Read and validate the entry for `key`. Expired and undecodable
    /// entries are deleted.
    fn load(&self, key: &str) -> Option<Value> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(
                    target = "gantry::cache",
                    backend = BACKEND,
                    path = %path.display(),
                    error = %err,
                    "failed to read cache entry"
                );
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    target = "gantry::cache",
                    backend = BACKEND,
                    path = %path.display(),
                    error = %err,
                    "discarding undecodable cache entry"
                );
                remove_quietly(&path);
                return None;
            }
        };

        if entry.is_expired(OffsetDateTime::now_utc()) {
            remove_quietly(&path);
            record_expired(BACKEND);
            return None;
        }

        Some(entry.content)
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => debug!(
            target = "gantry::cache",
            backend = BACKEND,
            path = %path.display(),
            error = %err,
            "failed to remove cache entry"
        ),
    }
}

impl Cache for FileCache {
    fn init(&mut self, config: &str) -> Result<(), CacheError> {
        let config: FileCacheConfig = parse_config(config)?;
        if config.extension.is_empty() {
            return Err(CacheError::config("file cache extension must not be empty"));
        }
        if config.path.as_os_str().is_empty() {
            return Err(CacheError::config("file cache path must not be empty"));
        }
        fs::create_dir_all(&config.path)?;
        *self = Self::from_config(config);
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Value> {
        let value = self.load(key);
        record_lookup(BACKEND, value.is_some());
        value
    }

    fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry::new(value, ttl);
        let encoded = serde_json::to_vec(&entry)?;
        // `clear_all` removes the directory itself.
        fs::create_dir_all(&self.path)?;
        fs::write(self.entry_path(key), encoded)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.load(key).is_some()
    }

    fn clear_all(&self) -> Result<(), CacheError> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let matches_extension = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(&self.extension));
            if matches_extension && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }

        if let Err(err) = fs::remove_dir(&self.path) {
            debug!(
                target = "gantry::cache",
                backend = BACKEND,
                path = %self.path.display(),
                error = %err,
                "cache directory left in place"
            );
        }
        Ok(())
    }
}
