//! One-shot messages carried to the next page through the session bag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Session key the messages are stored under.
pub const FLASH_KEY: &str = "framework_flash";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flash {
    data: BTreeMap<String, String>,
}

impl Flash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message for `key`, e.g. `"success"` or `"error"`.
    pub fn set(&mut self, key: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.data.insert(key.into(), message.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }
}
