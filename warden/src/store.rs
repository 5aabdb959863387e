//! Key-value store capability
//!
//! The kernel never binds a concrete database. Components that need
//! durability (token tables, audit trail) consume this capability; deployers
//! hand in whatever durable implementation they run. The in-memory variant is
//! the default and is also what tests use.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::Result;

/// Durable key-value storage driven by the kernel's stores
///
/// Keys are opaque strings; values are JSON documents. Implementations must
/// be safe for concurrent use.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value at `key`
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` at `key`, replacing any existing value
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Delete `key`, reporting whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in ascending key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>>;
}

/// Map-backed store; nothing survives the process
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    map: DashMap<String, Value>,
}

impl InMemoryKeyValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when the store holds nothing
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.map.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.map.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let mut entries: Vec<(String, Value)> = self
            .map
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
