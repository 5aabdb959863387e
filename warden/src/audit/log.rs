//! Audit log facade
//!
//! Components record through `AuditLog` instead of touching the store:
//! appends assign ids, announce themselves on the event bus, and optionally
//! mirror to the log output. Failures to announce never fail the append.

use std::sync::Arc;

use serde_json::json;

use super::entry::{AuditEntry, AuditSeverity};
use super::store::{AuditQuery, AuditStore};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::AuditConfig;
use crate::error::Result;

/// Topic announced on every append
pub(crate) const TOPIC_AUDIT_WRITTEN: &str = "audit.entry.written";

/// Facade over an [`AuditStore`] with bus announcement and console mirroring
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    bus: Option<EventBus>,
    config: AuditConfig,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    /// Create a log writing to `store`
    pub fn new(store: Arc<dyn AuditStore>, config: AuditConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus: None,
            config,
            clock,
        }
    }

    /// Announce appends on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// The underlying store
    pub fn store(&self) -> Arc<dyn AuditStore> {
        self.store.clone()
    }

    /// Append an entry, returning its id
    pub async fn record(&self, entry: AuditEntry) -> Result<String> {
        let severity = entry.severity;
        let action = entry.action.clone();
        let execution_id = entry.execution_id.clone();
        let success = entry.success;

        let id = self.store.append(entry).await?;

        if self.config.console_mirror {
            tracing::info!(
                target: "warden::audit",
                id = %id,
                subject = %execution_id,
                severity = %severity,
                action = action.as_deref().unwrap_or(""),
                success,
                "audit entry written"
            );
        }

        if let Some(ref bus) = self.bus {
            let payload = json!({
                "id": id,
                "executionId": execution_id,
                "action": action,
                "success": success,
                "severity": severity,
            });
            if let Err(e) = bus.publish(TOPIC_AUDIT_WRITTEN, payload).await {
                tracing::warn!(error = %e, "failed to announce audit entry");
            }
        }

        Ok(id)
    }

    /// Append a security record
    pub async fn record_security(
        &self,
        subject: &str,
        action: &str,
        severity: AuditSeverity,
        actor: Option<&str>,
    ) -> Result<String> {
        let mut entry = AuditEntry::security(subject, action, severity, self.clock.now_ms());
        if let Some(actor) = actor {
            entry = entry.with_actor(actor);
        }
        self.record(entry).await
    }

    /// Query entries, newest-first
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.store.query(query).await
    }

    /// Fetch an entry by id
    pub async fn get(&self, id: &str) -> Result<Option<AuditEntry>> {
        self.store.get(id).await
    }

    /// Purge entries older than the cutoff, returning the count removed
    pub async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        self.store.purge_older_than(cutoff_ms).await
    }

    /// Purge entries past the configured retention window
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = self.clock.now_ms() - (self.config.retention_secs as i64) * 1_000;
        self.purge_older_than(cutoff).await
    }
}
