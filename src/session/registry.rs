//! Name → session store factory table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{FileSessionStore, SessionConfig, SessionError, SessionStore};

/// Builds a store from the shared session configuration.
pub type ProviderFactory = fn(&SessionConfig) -> Result<Arc<dyn SessionStore>, SessionError>;

fn file_provider(config: &SessionConfig) -> Result<Arc<dyn SessionStore>, SessionError> {
    let store = FileSessionStore::new(config)?;
    Ok(Arc::new(store))
}

#[derive(Clone, Default)]
pub struct SessionProviderRegistry {
    providers: HashMap<String, ProviderFactory>,
}

impl fmt::Debug for SessionProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SessionProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

impl SessionProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `file` provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .providers
            .insert("file".to_string(), file_provider);
        registry
    }

    pub fn register(&mut self, name: &str, factory: ProviderFactory) -> Result<(), SessionError> {
        if name.is_empty() {
            return Err(SessionError::DuplicateProvider {
                name: name.to_string(),
                reason: "provider name must not be empty",
            });
        }
        if self.providers.contains_key(name) {
            return Err(SessionError::DuplicateProvider {
                name: name.to_string(),
                reason: "provider registered twice",
            });
        }
        self.providers.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn construct(
        &self,
        name: &str,
        config: &SessionConfig,
    ) -> Result<Arc<dyn SessionStore>, SessionError> {
        let factory = self
            .providers
            .get(name)
            .ok_or_else(|| SessionError::UnknownProvider(name.to_string()))?;
        factory(config)
    }

    /// Like [`construct`](Self::construct), from a JSON configuration blob.
    pub fn construct_json(
        &self,
        name: &str,
        config: &str,
    ) -> Result<Arc<dyn SessionStore>, SessionError> {
        let config: SessionConfig = serde_json::from_str(config)
            .map_err(|err| SessionError::config(format!("session config: {err}")))?;
        self.construct(name, &config)
    }
}
