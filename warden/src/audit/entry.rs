//! Audit record types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{NetworkPolicy, ResourceLimits};

/// Audit record severity
///
/// Ordered like syslog: lower is more severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    /// Security-critical condition (token replay, isolation breach)
    Critical = 2,
    /// Error conditions
    Error = 3,
    /// Warning conditions
    Warning = 4,
    /// Normal but significant condition
    Notice = 5,
    /// Informational record
    Informational = 6,
}

impl std::fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::Error => write!(f, "ERROR"),
            Self::Warning => write!(f, "WARNING"),
            Self::Notice => write!(f, "NOTICE"),
            Self::Informational => write!(f, "INFO"),
        }
    }
}

/// A single immutable audit record
///
/// Execution records carry the full resource picture of a sandbox run.
/// Security records (registration, revocation, replay detection) reuse the
/// same shape with `action`/`actor` set and the execution-specific
/// measurements zeroed. Field names are part of the external contract and
/// must not be renamed or reordered without a version bump.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Record id; assigned on append when empty
    #[serde(default)]
    pub id: String,
    /// Subject id: the execution id, or the related entity for security records
    pub execution_id: String,
    /// Acting user, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Tenant, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Caller-provided correlation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Execution language, or a category tag for security records
    pub language: String,
    /// Hex prefix of the SHA-256 of the submitted code (empty for security records)
    pub code_hash: String,
    /// Size of the submitted code in bytes
    pub code_size_bytes: usize,
    /// Container id, once one existed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Unix ms when the action started
    pub start_time: i64,
    /// Unix ms when the action ended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Wall-clock duration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Container exit code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Whether the action succeeded
    pub success: bool,
    /// Whether the execution hit its timeout
    pub timed_out: bool,
    /// Whether the memory limit killed the execution
    pub oom_killed: bool,
    /// Peak memory observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    /// Bytes produced on stdout (pre-truncation)
    pub stdout_bytes: usize,
    /// Bytes produced on stderr (pre-truncation)
    pub stderr_bytes: usize,
    /// Error code/message for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the execution had network access
    pub network_enabled: bool,
    /// Resource limits in force
    pub resource_limits: ResourceLimits,
    /// Client IP, when the boundary supplied it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// User agent, when the boundary supplied it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Record severity
    #[serde(default = "default_severity")]
    pub severity: AuditSeverity,
    /// Action tag for security records (e.g. `reuse_attempt`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Acting principal for security records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

fn default_severity() -> AuditSeverity {
    AuditSeverity::Informational
}

impl AuditEntry {
    /// Start an execution record
    pub fn execution(
        execution_id: impl Into<String>,
        language: impl Into<String>,
        start_time: i64,
    ) -> Self {
        Self {
            id: String::new(),
            execution_id: execution_id.into(),
            user_id: None,
            tenant_id: None,
            correlation_id: None,
            language: language.into(),
            code_hash: String::new(),
            code_size_bytes: 0,
            container_id: None,
            start_time,
            end_time: None,
            duration_ms: None,
            exit_code: None,
            success: false,
            timed_out: false,
            oom_killed: false,
            memory_used_bytes: None,
            stdout_bytes: 0,
            stderr_bytes: 0,
            error: None,
            network_enabled: false,
            resource_limits: ResourceLimits::default(),
            client_ip: None,
            user_agent: None,
            severity: AuditSeverity::Informational,
            action: None,
            actor: None,
        }
    }

    /// Build a security record
    ///
    /// `subject` identifies the entity acted on (client id, token family,
    /// request id); `action` is the stable action tag.
    pub fn security(
        subject: impl Into<String>,
        action: impl Into<String>,
        severity: AuditSeverity,
        timestamp: i64,
    ) -> Self {
        let mut entry = Self::execution(subject, "oauth", timestamp);
        entry.action = Some(action.into());
        entry.severity = severity;
        entry
    }

    /// Set the acting principal
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self.user_id = self.user_id.or_else(|| self.actor.clone());
        self
    }

    /// Set the success flag
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Set the error string
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Assign a fresh id when none is set
    pub(crate) fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
    }
}

/// Hex prefix of the SHA-256 digest of `code`, used to identify submitted
/// code in audit records without storing it
pub(crate) fn code_hash_prefix(code: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(code.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_entry_serializes_with_stable_names() {
        let mut entry = AuditEntry::execution("exec-1", "python", 1_000);
        entry.code_hash = code_hash_prefix("print(1)");
        entry.code_size_bytes = 8;
        entry.ensure_id();

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["executionId"], "exec-1");
        assert_eq!(json["codeSizeBytes"], 8);
        assert_eq!(json["startTime"], 1_000);
        assert_eq!(json["networkEnabled"], false);
        assert!(json.get("endTime").is_none());
        assert!(json["codeHash"].as_str().unwrap().len() == 16);
    }

    #[test]
    fn security_entry_carries_actor_and_action() {
        let entry = AuditEntry::security("family-9", "reuse_attempt", AuditSeverity::Critical, 5)
            .with_actor("user-1");
        assert_eq!(entry.action.as_deref(), Some("reuse_attempt"));
        assert_eq!(entry.actor.as_deref(), Some("user-1"));
        assert_eq!(entry.user_id.as_deref(), Some("user-1"));
        assert_eq!(entry.severity, AuditSeverity::Critical);
        assert!(!entry.success);
    }

    #[test]
    fn code_hash_prefix_is_hex_and_stable() {
        let a = code_hash_prefix("echo hi");
        let b = code_hash_prefix("echo hi");
        let c = code_hash_prefix("echo bye");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn severity_orders_critical_first() {
        assert!(AuditSeverity::Critical < AuditSeverity::Warning);
        assert!(AuditSeverity::Warning < AuditSeverity::Informational);
    }
}
