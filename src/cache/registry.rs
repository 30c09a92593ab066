//! Name → backend factory table used to build caches from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{Cache, CacheError, FileCache, MemoryCache};

/// Produces a fresh, uninitialised backend.
pub type AdapterFactory = fn() -> Box<dyn Cache>;

#[derive(Debug, Clone, Default)]
pub struct CacheAdapterRegistry {
    adapters: HashMap<String, AdapterFactory>,
}

impl CacheAdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `memory` and `file` adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .adapters
            .insert("memory".to_string(), || Box::new(MemoryCache::new()));
        registry
            .adapters
            .insert("file".to_string(), || Box::new(FileCache::new()));
        registry
    }

    /// Register `factory` under `name`. Names are unique and non-empty.
    pub fn register(&mut self, name: &str, factory: AdapterFactory) -> Result<(), CacheError> {
        if name.is_empty() {
            return Err(CacheError::DuplicateAdapter {
                name: name.to_string(),
                reason: "adapter name must not be empty",
            });
        }
        if self.adapters.contains_key(name) {
            return Err(CacheError::DuplicateAdapter {
                name: name.to_string(),
                reason: "adapter registered twice",
            });
        }
        self.adapters.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered adapter names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build and initialise the adapter registered under `name`.
    pub fn construct(&self, name: &str, config: &str) -> Result<Arc<dyn Cache>, CacheError> {
        let factory = self
            .adapters
            .get(name)
            .ok_or_else(|| CacheError::UnknownAdapter(name.to_string()))?;

        let mut cache = factory();
        cache.init(config)?;
        info!(target = "gantry::cache", adapter = name, "cache adapter ready");
        Ok(Arc::from(cache))
    }
}
