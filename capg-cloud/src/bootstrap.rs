//! Bootstrap data retrieval.
//!
//! Bootstrap payloads are produced by an external bootstrap provider and
//! stored as secrets; scopes only know the secret's name.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Resolves bootstrap secrets by (namespace, name).
#[async_trait]
pub trait BootstrapSource: Send + Sync {
    /// Fetch the secret's `value` key. `Ok(None)` means the secret does not
    /// exist yet.
    async fn fetch(&self, namespace: &str, secret: &str) -> Result<Option<String>>;
}

/// Bootstrap secrets held in memory.
#[derive(Default)]
pub struct StaticBootstrap {
    secrets: RwLock<HashMap<(String, String), String>>,
}

impl StaticBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, secret: &str, value: impl Into<String>) {
        self.secrets
            .write()
            .insert((namespace.to_string(), secret.to_string()), value.into());
    }

    pub fn remove(&self, namespace: &str, secret: &str) -> Option<String> {
        self.secrets
            .write()
            .remove(&(namespace.to_string(), secret.to_string()))
    }
}

#[async_trait]
impl BootstrapSource for StaticBootstrap {
    async fn fetch(&self, namespace: &str, secret: &str) -> Result<Option<String>> {
        Ok(self
            .secrets
            .read()
            .get(&(namespace.to_string(), secret.to_string()))
            .cloned())
    }
}
