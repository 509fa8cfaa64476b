//! Key-value store capability and the driver registry.
//!
//! Only `get` / `set` / `del` (plus prefix listing) matter to the core; the
//! concrete backend is a driver chosen by name from an explicit registry
//! built at startup. Unknown drivers fall back to the in-memory store so a
//! misconfigured node degrades instead of failing to boot.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::errors::Result;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, data: Vec<u8>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    /// All entries whose key starts with `prefix`, unordered.
    async fn range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Process-local store used by tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), data);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}

type StoreConstructor = Box<dyn Fn() -> Arc<dyn Store> + Send + Sync>;

/// Explicit driver registry. Constructors are registered at startup; there
/// are no module-init side effects.
pub struct StoreRegistry {
    constructors: HashMap<String, StoreConstructor>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in `memory` driver.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", || Arc::new(MemoryStore::new()));
        registry
    }

    pub fn register<F>(&mut self, driver: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn Store> + Send + Sync + 'static,
    {
        self.constructors
            .insert(driver.to_string(), Box::new(constructor));
    }

    /// Build a store for `driver`, falling back to `memory` when unknown.
    pub fn create(&self, driver: &str) -> Arc<dyn Store> {
        if let Some(constructor) = self.constructors.get(driver) {
            return constructor();
        }
        warn!(driver = %driver, "unknown store driver, falling back to memory");
        Arc::new(MemoryStore::new())
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.set("entity/e1", b"snapshot".to_vec()).await.unwrap();
        assert_eq!(
            store.get("entity/e1").await.unwrap(),
            Some(b"snapshot".to_vec())
        );
        store.del("entity/e1").await.unwrap();
        assert_eq!(store.get("entity/e1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn range_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("mapper/m1", b"1".to_vec()).await.unwrap();
        store.set("mapper/m2", b"2".to_vec()).await.unwrap();
        store.set("entity/e1", b"3".to_vec()).await.unwrap();
        let mappers = store.range("mapper/").await.unwrap();
        assert_eq!(mappers.len(), 2);
    }

    #[tokio::test]
    async fn unknown_driver_falls_back_to_memory() {
        let registry = StoreRegistry::with_defaults();
        let store = registry.create("etcd-but-missing");
        store.set("k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
