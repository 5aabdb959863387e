//! Container runtime capability
//!
//! The orchestrator drives whatever process-isolation facility the host
//! provides through this trait. The contract is behavioral: resource limits
//! honored, privileges dropped, labels set, and exit code plus OOM flag
//! observable. The CLI vocabulary of any particular runtime stays inside its
//! implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ImagePullPolicy, NetworkPolicy, ResourceLimits};
use crate::error::Result;

/// A file materialized in the container workspace before start
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFile {
    /// Path relative to the workspace
    pub path: String,
    /// File content
    pub content: String,
    /// Set the executable bit
    #[serde(default)]
    pub executable: bool,
}

/// What to launch: image, command, inputs, and identifying labels
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Execution id recorded on the container
    pub execution_id: String,
    /// Language tag recorded on the container
    pub language: String,
    /// Image reference
    pub image: String,
    /// Command run as pid 1
    pub command: Vec<String>,
    /// Data piped to the command's stdin
    pub stdin: Option<String>,
    /// Environment, already filtered to safe names
    pub env: BTreeMap<String, String>,
    /// Files placed in the workspace
    pub files: Vec<WorkspaceFile>,
    /// Owning user, when known
    pub user_id: Option<String>,
    /// Owning tenant, when known
    pub tenant_id: Option<String>,
}

impl LaunchSpec {
    /// Labels identifying the container to reapers and auditors
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("warden.managed".to_string(), "true".to_string());
        labels.insert("warden.execution-id".to_string(), self.execution_id.clone());
        labels.insert("warden.language".to_string(), self.language.clone());
        if let Some(ref user_id) = self.user_id {
            labels.insert("warden.user-id".to_string(), user_id.clone());
        }
        if let Some(ref tenant_id) = self.tenant_id {
            labels.insert("warden.tenant-id".to_string(), tenant_id.clone());
        }
        labels
    }
}

/// Isolation profile applied to one execution
///
/// This is the merged view of the configured defaults and the caller's
/// overrides, validated before it reaches the adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionProfile {
    /// Wall-clock budget for the execution
    pub timeout_ms: u64,
    /// Resource caps
    pub resources: ResourceLimits,
    /// Network policy
    pub network: NetworkPolicy,
    /// Read-only root with a writable tmpfs workspace
    pub read_only_root_fs: bool,
    /// Drop all capabilities
    pub drop_all_capabilities: bool,
    /// Apply the generated seccomp profile
    pub use_seccomp: bool,
    /// Refuse to run as root
    pub run_as_non_root: bool,
    /// Container uid
    pub user_id: u32,
    /// Container gid
    pub group_id: u32,
    /// Workspace path inside the container
    pub work_dir: String,
    /// Image pull policy
    pub image_pull_policy: ImagePullPolicy,
}

/// Observed container exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process exit code
    pub exit_code: i64,
    /// Whether the kernel's memory limit killed the container
    pub oom_killed: bool,
}

/// Captured output streams
#[derive(Debug, Clone, Default)]
pub struct ContainerLogs {
    /// Bytes written to stdout
    pub stdout: Vec<u8>,
    /// Bytes written to stderr
    pub stderr: Vec<u8>,
}

/// Resource usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStats {
    /// Peak or current memory usage in bytes
    pub memory_used_bytes: u64,
}

/// Lifecycle states tracked per container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Creation requested
    Creating,
    /// Created but not started
    Created,
    /// Running
    Running,
    /// Exited or forcibly stopped
    Stopped,
    /// Removed from the host
    Removed,
    /// A lifecycle operation failed
    Error,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Removed => write!(f, "removed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Capability for driving an external isolation facility
///
/// `stop` and `remove` must be idempotent. `wait_for_exit` is the sole
/// authority for forcibly stopping a container on timeout, and its timeout
/// error must be distinguishable from a normal exit.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Probe whether the runtime is usable at all
    async fn available(&self) -> bool;

    /// Whether `image` is present locally
    async fn has_image(&self, image: &str) -> Result<bool>;

    /// Pull `image`
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Materialize an isolated container, returning its id
    async fn create_container(&self, spec: &LaunchSpec, profile: &ExecutionProfile)
        -> Result<String>;

    /// Start a created container
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Block until exit or timeout
    ///
    /// On timeout the container is forcibly stopped and an
    /// `execution_timeout` error is returned.
    async fn wait_for_exit(&self, container_id: &str, timeout_ms: u64) -> Result<ExitStatus>;

    /// Captured stdout/stderr
    async fn get_logs(&self, container_id: &str) -> Result<ContainerLogs>;

    /// Resource usage snapshot
    async fn get_stats(&self, container_id: &str) -> Result<ContainerStats>;

    /// Stop the container; succeeds when already stopped
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Remove the container; succeeds when already removed
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Kill and remove tracked containers created before `older_than_ms`
    ///
    /// Returns the number of containers removed.
    async fn reap(&self, older_than_ms: i64) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_identify_execution() {
        let spec = LaunchSpec {
            execution_id: "exec-7".to_string(),
            language: "python".to_string(),
            image: "python:3.12-alpine".to_string(),
            command: vec!["python".to_string(), "main.py".to_string()],
            stdin: None,
            env: BTreeMap::new(),
            files: Vec::new(),
            user_id: Some("u1".to_string()),
            tenant_id: None,
        };
        let labels = spec.labels();
        assert_eq!(labels.get("warden.execution-id").unwrap(), "exec-7");
        assert_eq!(labels.get("warden.language").unwrap(), "python");
        assert_eq!(labels.get("warden.user-id").unwrap(), "u1");
        assert!(!labels.contains_key("warden.tenant-id"));
    }

    #[test]
    fn container_state_display_matches_serde() {
        assert_eq!(ContainerState::Creating.to_string(), "creating");
        let json = serde_json::to_string(&ContainerState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
