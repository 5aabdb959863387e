//! Execution request/result envelopes and admission validation

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{validate_network_policy, ImagePullPolicy, NetworkPolicy, SandboxConfig};
use crate::error::{Error, Result, SandboxError, SandboxErrorKind};
use crate::runtime::{ExecutionProfile, WorkspaceFile};

static ENV_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"));

const MAX_ENV_VARS: usize = 64;
const MAX_ENV_VALUE_BYTES: usize = 32_768;
const MAX_STDIN_BYTES: usize = 1_048_576;

/// Languages the sandbox can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// POSIX shell script
    Bash,
    /// Python script
    Python,
    /// Node.js script
    Javascript,
}

impl Language {
    /// Entry file name placed in the workspace
    pub fn entry_file(&self) -> &'static str {
        match self {
            Self::Bash => "main.sh",
            Self::Python => "main.py",
            Self::Javascript => "main.js",
        }
    }

    /// Interpreter command for the entry file
    pub fn command(&self) -> Vec<String> {
        match self {
            Self::Bash => vec!["/bin/sh".to_string(), "main.sh".to_string()],
            Self::Python => vec!["python".to_string(), "main.py".to_string()],
            Self::Javascript => vec!["node".to_string(), "main.js".to_string()],
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bash => write!(f, "bash"),
            Self::Python => write!(f, "python"),
            Self::Javascript => write!(f, "javascript"),
        }
    }
}

/// Partial resource overrides supplied by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverrides {
    /// Memory cap in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    /// Memory+swap cap in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap_bytes: Option<u64>,
    /// CPU quota
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    /// Process cap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<u64>,
    /// Output bound per stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,
}

/// Per-request configuration overrides, merged over the configured defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecOverrides {
    /// Execution timeout in ms, capped by the hard limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Resource overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceOverrides>,
    /// Replacement network policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPolicy>,
    /// Replacement pull policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<ImagePullPolicy>,
}

/// A request to execute untrusted code
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Caller-chosen id; assigned when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Language to run
    pub language: Language,
    /// The code itself
    pub code: String,
    /// Data piped to stdin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Environment variables, names restricted to a safe pattern
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Additional workspace files
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<WorkspaceFile>,
    /// Configuration overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ExecOverrides>,
    /// Requesting user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Requesting tenant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Caller correlation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Outcome of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Execution id
    pub execution_id: String,
    /// `exit_code == 0 && !timed_out && !oom_killed`
    pub success: bool,
    /// Process exit code; -1 when no exit was observed
    pub exit_code: i64,
    /// Captured stdout, truncated to the output bound
    pub stdout: String,
    /// Captured stderr, truncated to the output bound
    pub stderr: String,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Peak memory observed
    pub memory_used_bytes: u64,
    /// Whether the timeout fired
    pub timed_out: bool,
    /// Whether the memory limit killed the execution
    pub oom_killed: bool,
    /// Error code and message for abnormal outcomes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Container that ran the code, once one existed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Completion time, unix ms
    #[serde(rename = "timestamp")]
    pub completed_at: i64,
}

/// Validate a request against the configured hard caps
pub fn validate_request(request: &ExecutionRequest, config: &SandboxConfig) -> Result<()> {
    if request.code.is_empty() {
        return Err(invalid(SandboxErrorKind::InvalidRequest, "code is empty"));
    }
    if request.code.len() > config.max_code_size_bytes {
        return Err(invalid(
            SandboxErrorKind::CodeTooLarge,
            format!(
                "code is {} bytes, cap is {}",
                request.code.len(),
                config.max_code_size_bytes
            ),
        ));
    }

    if request.env.len() > MAX_ENV_VARS {
        return Err(invalid(
            SandboxErrorKind::InvalidRequest,
            format!("too many environment variables (max {})", MAX_ENV_VARS),
        ));
    }
    for (name, value) in &request.env {
        if !ENV_NAME.is_match(name) {
            return Err(invalid(
                SandboxErrorKind::InvalidRequest,
                format!("environment name '{}' is not allowed", name),
            ));
        }
        if value.len() > MAX_ENV_VALUE_BYTES {
            return Err(invalid(
                SandboxErrorKind::InvalidRequest,
                format!("environment value for '{}' is too large", name),
            ));
        }
    }

    if let Some(ref stdin) = request.stdin {
        if stdin.len() > MAX_STDIN_BYTES {
            return Err(invalid(
                SandboxErrorKind::InvalidRequest,
                "stdin is too large",
            ));
        }
    }

    if request.files.len() > config.max_files {
        return Err(invalid(
            SandboxErrorKind::InvalidRequest,
            format!("too many files (max {})", config.max_files),
        ));
    }
    let max_file_size = config.resources.max_file_size_bytes;
    for file in &request.files {
        if file.path.is_empty()
            || file.path.starts_with('/')
            || file.path.split('/').any(|part| part == "..")
        {
            return Err(invalid(
                SandboxErrorKind::InvalidRequest,
                format!("file path '{}' is not allowed", file.path),
            ));
        }
        if file.path == request.language.entry_file() {
            return Err(invalid(
                SandboxErrorKind::InvalidRequest,
                format!("file path '{}' collides with the entry file", file.path),
            ));
        }
        if file.content.len() > max_file_size {
            return Err(invalid(
                SandboxErrorKind::InvalidRequest,
                format!("file '{}' exceeds {} bytes", file.path, max_file_size),
            ));
        }
    }

    if let Some(ref overrides) = request.config {
        if let Some(timeout_ms) = overrides.timeout_ms {
            if timeout_ms == 0 || timeout_ms > config.max_timeout_ms {
                return Err(invalid(
                    SandboxErrorKind::InvalidRequest,
                    format!(
                        "timeout_ms must be in 1..={}, got {}",
                        config.max_timeout_ms, timeout_ms
                    ),
                ));
            }
        }
        if let Some(ref resources) = overrides.resources {
            if resources.cpus.is_some_and(|cpus| cpus <= 0.0) {
                return Err(invalid(
                    SandboxErrorKind::InvalidRequest,
                    "cpus must be positive",
                ));
            }
            if resources.pids_limit.is_some_and(|pids| pids == 0) {
                return Err(invalid(
                    SandboxErrorKind::InvalidRequest,
                    "pids_limit must be positive",
                ));
            }
            if resources.memory_bytes.is_some_and(|m| m == 0) {
                return Err(invalid(
                    SandboxErrorKind::InvalidRequest,
                    "memory_bytes must be positive",
                ));
            }
        }
        if let Some(ref network) = overrides.network {
            validate_network_policy(network).map_err(|e| {
                invalid(SandboxErrorKind::InvalidRequest, e.to_string())
            })?;
        }
    }

    Ok(())
}

/// Merge the configured defaults with the caller's overrides
pub fn merge_profile(config: &SandboxConfig, overrides: Option<&ExecOverrides>) -> ExecutionProfile {
    let mut resources = config.resources.clone();
    let mut network = config.network.clone();
    let mut timeout_ms = config.default_timeout_ms;
    let mut image_pull_policy = config.image_pull_policy;

    if let Some(overrides) = overrides {
        if let Some(t) = overrides.timeout_ms {
            timeout_ms = t.min(config.max_timeout_ms);
        }
        if let Some(ref r) = overrides.resources {
            if let Some(memory_bytes) = r.memory_bytes {
                resources.memory_bytes = memory_bytes;
                // Swap never falls below the memory cap.
                resources.memory_swap_bytes = r
                    .memory_swap_bytes
                    .unwrap_or(memory_bytes)
                    .max(memory_bytes);
            } else if let Some(swap) = r.memory_swap_bytes {
                resources.memory_swap_bytes = swap.max(resources.memory_bytes);
            }
            if let Some(cpus) = r.cpus {
                resources.cpus = cpus;
            }
            if let Some(pids) = r.pids_limit {
                resources.pids_limit = pids;
            }
            if let Some(output) = r.max_output_bytes {
                resources.max_output_bytes = output;
            }
        }
        if let Some(ref n) = overrides.network {
            network = n.clone();
        }
        if let Some(policy) = overrides.image_pull_policy {
            image_pull_policy = policy;
        }
    }

    ExecutionProfile {
        timeout_ms,
        resources,
        network,
        read_only_root_fs: config.read_only_root_fs,
        drop_all_capabilities: config.drop_all_capabilities,
        use_seccomp: config.use_seccomp,
        run_as_non_root: config.run_as_non_root,
        user_id: config.user_id,
        group_id: config.group_id,
        work_dir: config.work_dir.clone(),
        image_pull_policy,
    }
}

/// Build the environment map in deterministic order
pub(crate) fn env_map(request: &ExecutionRequest) -> BTreeMap<String, String> {
    request
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Truncate an output stream to `max` bytes, appending a marker naming the
/// original size when anything was cut
pub(crate) fn truncate_output(bytes: &[u8], max: usize) -> (String, usize) {
    let original = bytes.len();
    if original <= max {
        return (String::from_utf8_lossy(bytes).into_owned(), original);
    }
    let mut text = String::from_utf8_lossy(&bytes[..max]).into_owned();
    text.push_str(&format!("\n...[truncated, {} bytes total]", original));
    (text, original)
}

fn invalid(kind: SandboxErrorKind, message: impl Into<String>) -> Error {
    Error::Sandbox(SandboxError::new(kind, message))
}
