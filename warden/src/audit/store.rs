//! Audit storage trait and backend implementations
//!
//! The in-memory ring keeps a bounded window of recent entries and evicts in
//! chunks; the key-value-backed variant persists entries through whatever
//! durable store the deployment provides. Both answer the same queries.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::entry::AuditEntry;
use crate::error::{Error, Result};
use crate::store::KeyValueStore;
use std::sync::Arc;

/// Filter for audit queries
///
/// All fields are conjunctive; unset fields match everything. Results are
/// returned newest-first.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Match a specific user
    pub user_id: Option<String>,
    /// Match a specific tenant
    pub tenant_id: Option<String>,
    /// Entries starting at or after this unix ms
    pub start_time: Option<i64>,
    /// Entries starting at or before this unix ms
    pub end_time: Option<i64>,
    /// Match the success flag
    pub success: Option<bool>,
    /// Match the language/category tag
    pub language: Option<String>,
    /// Maximum rows returned
    pub limit: usize,
    /// Rows skipped before the first returned
    pub offset: usize,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref user_id) = self.user_id {
            if entry.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(ref tenant_id) = self.tenant_id {
            if entry.tenant_id.as_deref() != Some(tenant_id.as_str()) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if entry.start_time < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if entry.start_time > end {
                return false;
            }
        }
        if let Some(success) = self.success {
            if entry.success != success {
                return false;
            }
        }
        if let Some(ref language) = self.language {
            if &entry.language != language {
                return false;
            }
        }
        true
    }

    fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            100
        } else {
            self.limit
        }
    }
}

/// Audit entry persistence
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append an entry, returning its id
    ///
    /// Assigns a fresh id when the entry carries none.
    async fn append(&self, entry: AuditEntry) -> Result<String>;

    /// Query entries, newest-first
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>>;

    /// Fetch a single entry by id
    async fn get(&self, id: &str) -> Result<Option<AuditEntry>>;

    /// Delete entries that started before `cutoff_ms`, returning the count
    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64>;

    /// Number of stored entries
    async fn count(&self) -> Result<usize>;
}

/// Bounded in-memory ring of audit entries
///
/// When full, the oldest 10% of entries are evicted in one step so appends
/// stay O(1) amortized.
pub struct InMemoryAuditStore {
    entries: Mutex<VecDeque<AuditEntry>>,
    max_entries: usize,
}

impl InMemoryAuditStore {
    /// Create a ring holding at most `max_entries`
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, mut entry: AuditEntry) -> Result<String> {
        entry.ensure_id();
        let id = entry.id.clone();

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.max_entries {
            let evict = (self.max_entries / 10).max(1);
            let len = entries.len();
            entries.drain(..evict.min(len));
        }
        entries.push_back(entry);
        Ok(id)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(hits
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<AuditEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.start_time >= cutoff_ms);
        Ok((before - entries.len()) as u64)
    }

    async fn count(&self) -> Result<usize> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.len())
    }
}

/// Key-value-backed audit store
///
/// Keys embed the start timestamp so prefix scans come back in time order.
pub struct KvAuditStore {
    kv: Arc<dyn KeyValueStore>,
    key_prefix: String,
}

impl KvAuditStore {
    /// Create a store persisting through `kv`
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            key_prefix: "audit".to_string(),
        }
    }

    /// Create with a custom key prefix
    pub fn with_prefix(kv: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            key_prefix: prefix.into(),
        }
    }

    fn entry_key(&self, start_time: i64, id: &str) -> String {
        // Zero-padded so lexicographic order equals time order.
        format!("{}:{:020}:{}", self.key_prefix, start_time.max(0), id)
    }

    fn index_key(&self, id: &str) -> String {
        format!("{}:id:{}", self.key_prefix, id)
    }

    fn scan_prefix(&self) -> String {
        format!("{}:0", self.key_prefix)
    }
}

#[async_trait]
impl AuditStore for KvAuditStore {
    async fn append(&self, mut entry: AuditEntry) -> Result<String> {
        entry.ensure_id();
        let id = entry.id.clone();
        let key = self.entry_key(entry.start_time, &id);

        let value = serde_json::to_value(&entry)
            .map_err(|e| Error::Audit(format!("failed to serialize entry: {}", e)))?;
        self.kv.put(&key, value).await?;
        self.kv
            .put(&self.index_key(&id), serde_json::Value::String(key))
            .await?;
        Ok(id)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let rows = self.kv.scan_prefix(&self.scan_prefix()).await?;
        let mut hits: Vec<AuditEntry> = Vec::new();
        for (_, value) in rows {
            let entry: AuditEntry = serde_json::from_value(value)
                .map_err(|e| Error::Audit(format!("failed to decode entry: {}", e)))?;
            if query.matches(&entry) {
                hits.push(entry);
            }
        }
        hits.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(hits
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<AuditEntry>> {
        let Some(key) = self.kv.get(&self.index_key(id)).await? else {
            return Ok(None);
        };
        let Some(key) = key.as_str().map(str::to_string) else {
            return Ok(None);
        };
        match self.kv.get(&key).await? {
            Some(value) => {
                let entry = serde_json::from_value(value)
                    .map_err(|e| Error::Audit(format!("failed to decode entry: {}", e)))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let rows = self.kv.scan_prefix(&self.scan_prefix()).await?;
        let mut purged = 0u64;
        for (key, value) in rows {
            let entry: AuditEntry = serde_json::from_value(value)
                .map_err(|e| Error::Audit(format!("failed to decode entry: {}", e)))?;
            if entry.start_time < cutoff_ms {
                self.kv.delete(&key).await?;
                self.kv.delete(&self.index_key(&entry.id)).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.kv.scan_prefix(&self.scan_prefix()).await?.len())
    }
}
