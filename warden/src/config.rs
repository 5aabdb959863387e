//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: WARDEN_)
//! 2. A TOML file (./warden.toml by default)
//! 3. Default values
//!
//! One validated blob covers every kernel component: OAuth TTLs and
//! algorithms, sandbox hard caps and per-execution defaults, bus retention
//! defaults, audit retention, and rate-limiter shape. Nothing in the kernel
//! reads the shell environment directly.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service identity and logging
    #[serde(default)]
    pub service: ServiceConfig,

    /// OAuth authorization core configuration
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Sandbox orchestrator configuration
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Event bus configuration
    #[serde(default)]
    pub bus: BusConfig,

    /// Audit trail configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name used in audit records and event payloads
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

/// OAuth authorization core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Issuer URL reported in discovery metadata
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Access token lifetime in seconds
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl_secs: u64,

    /// Authorization code lifetime in seconds (hard cap 60)
    #[serde(default = "default_auth_code_ttl")]
    pub auth_code_ttl_secs: u64,

    /// Scopes the server is willing to grant
    #[serde(default = "default_allowed_scopes")]
    pub allowed_scopes: Vec<String>,

    /// Whether DPoP proofs are accepted and advertised
    #[serde(default = "default_true")]
    pub dpop_enabled: bool,

    /// Accepted DPoP signing algorithms
    #[serde(default = "default_dpop_algs")]
    pub dpop_algs: Vec<String>,

    /// Maximum accepted |now - iat| skew for DPoP proofs, in seconds
    #[serde(default = "default_dpop_max_age")]
    pub dpop_max_age_secs: i64,

    /// Interval between purges of expired codes and tokens, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Bound on the revoked-family set; the oldest half is discarded above it
    #[serde(default = "default_revoked_family_high_water")]
    pub revoked_family_high_water: usize,

    /// Authorization endpoint path
    #[serde(default = "default_authorization_endpoint")]
    pub authorization_endpoint: String,

    /// Token endpoint path
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,

    /// Revocation endpoint path
    #[serde(default = "default_revocation_endpoint")]
    pub revocation_endpoint: String,

    /// Introspection endpoint path
    #[serde(default = "default_introspection_endpoint")]
    pub introspection_endpoint: String,

    /// Dynamic client registration endpoint path
    #[serde(default = "default_registration_endpoint")]
    pub registration_endpoint: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            access_token_ttl_secs: default_access_token_ttl(),
            refresh_token_ttl_secs: default_refresh_token_ttl(),
            auth_code_ttl_secs: default_auth_code_ttl(),
            allowed_scopes: default_allowed_scopes(),
            dpop_enabled: true,
            dpop_algs: default_dpop_algs(),
            dpop_max_age_secs: default_dpop_max_age(),
            cleanup_interval_secs: default_cleanup_interval(),
            revoked_family_high_water: default_revoked_family_high_water(),
            authorization_endpoint: default_authorization_endpoint(),
            token_endpoint: default_token_endpoint(),
            revocation_endpoint: default_revocation_endpoint(),
            introspection_endpoint: default_introspection_endpoint(),
            registration_endpoint: default_registration_endpoint(),
        }
    }
}

/// Image pull policy for sandbox container images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImagePullPolicy {
    /// Pull before every execution
    Always,
    /// Pull only when the image is absent
    IfNotPresent,
    /// Never pull; fail when the image is absent
    Never,
}

impl Default for ImagePullPolicy {
    fn default() -> Self {
        Self::IfNotPresent
    }
}

/// Per-execution resource limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory cap in bytes
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,

    /// Memory+swap cap in bytes
    #[serde(default = "default_memory_bytes")]
    pub memory_swap_bytes: u64,

    /// CPU quota in whole or fractional cores
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// Maximum number of processes
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u64,

    /// Maximum bytes kept per output stream before truncation
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Maximum size of a single uploaded file
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: default_memory_bytes(),
            memory_swap_bytes: default_memory_bytes(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            max_output_bytes: default_max_output_bytes(),
            max_file_size_bytes: default_max_file_size_bytes(),
        }
    }
}

/// Network policy for sandboxed executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Whether the container gets a network namespace at all
    #[serde(default)]
    pub enabled: bool,

    /// Hosts the container may reach; must be non-empty when enabled
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Ports the container may reach
    #[serde(default)]
    pub allowed_ports: Vec<u16>,

    /// DNS servers injected into the container
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Per-language container images
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxImages {
    /// Image for bash executions
    #[serde(default = "default_bash_image")]
    pub bash: String,

    /// Image for python executions
    #[serde(default = "default_python_image")]
    pub python: String,

    /// Image for javascript executions
    #[serde(default = "default_javascript_image")]
    pub javascript: String,
}

impl Default for SandboxImages {
    fn default() -> Self {
        Self {
            bash: default_bash_image(),
            python: default_python_image(),
            javascript: default_javascript_image(),
        }
    }
}

/// Sandbox orchestrator configuration: hard caps plus per-execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Maximum in-flight executions
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Hard cap on submitted code size in bytes
    #[serde(default = "default_max_code_size")]
    pub max_code_size_bytes: usize,

    /// Hard cap on a single execution timeout in milliseconds
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Maximum number of files attached to a request
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Default execution timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Default resource limits, overridable per request
    #[serde(default)]
    pub resources: ResourceLimits,

    /// Default network policy, overridable per request
    #[serde(default)]
    pub network: NetworkPolicy,

    /// Mount the root filesystem read-only with a writable tmpfs workdir
    #[serde(default = "default_true")]
    pub read_only_root_fs: bool,

    /// Drop all Linux capabilities
    #[serde(default = "default_true")]
    pub drop_all_capabilities: bool,

    /// Apply the generated seccomp profile
    #[serde(default = "default_true")]
    pub use_seccomp: bool,

    /// Run as a non-root uid/gid
    #[serde(default = "default_true")]
    pub run_as_non_root: bool,

    /// Container uid
    #[serde(default = "default_sandbox_uid")]
    pub user_id: u32,

    /// Container gid
    #[serde(default = "default_sandbox_uid")]
    pub group_id: u32,

    /// Working directory inside the container
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// Image pull policy
    #[serde(default)]
    pub image_pull_policy: ImagePullPolicy,

    /// Container runtime binary driven by the CLI adapter
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,

    /// Per-language container images
    #[serde(default)]
    pub images: SandboxImages,

    /// Interval between container reap passes, in seconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Containers older than this are reaped, in seconds
    #[serde(default = "default_reap_max_age")]
    pub reap_max_age_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent(),
            max_code_size_bytes: default_max_code_size(),
            max_timeout_ms: default_max_timeout_ms(),
            max_files: default_max_files(),
            default_timeout_ms: default_timeout_ms(),
            resources: ResourceLimits::default(),
            network: NetworkPolicy::default(),
            read_only_root_fs: true,
            drop_all_capabilities: true,
            use_seccomp: true,
            run_as_non_root: true,
            user_id: default_sandbox_uid(),
            group_id: default_sandbox_uid(),
            work_dir: default_work_dir(),
            image_pull_policy: ImagePullPolicy::default(),
            runtime_binary: default_runtime_binary(),
            images: SandboxImages::default(),
            reap_interval_secs: default_reap_interval(),
            reap_max_age_secs: default_reap_max_age(),
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Retained events kept per topic unless the topic overrides it
    #[serde(default = "default_retain_count")]
    pub default_retain_count: usize,

    /// Retained event age bound per topic, in milliseconds
    #[serde(default = "default_retain_duration_ms")]
    pub default_retain_duration_ms: i64,

    /// Subscriber cap per topic
    #[serde(default = "default_max_subscribers")]
    pub default_max_subscribers: usize,

    /// Bound on outstanding delayed events
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Reserved dead-letter topic name
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,

    /// Default per-subscription concurrency
    #[serde(default = "default_bus_concurrency")]
    pub default_concurrency: usize,

    /// Default handler timeout in milliseconds
    #[serde(default = "default_bus_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_retain_count: default_retain_count(),
            default_retain_duration_ms: default_retain_duration_ms(),
            default_max_subscribers: default_max_subscribers(),
            max_queue_size: default_max_queue_size(),
            dead_letter_topic: default_dead_letter_topic(),
            default_concurrency: default_bus_concurrency(),
            default_timeout_ms: default_bus_timeout_ms(),
        }
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// In-memory ring capacity
    #[serde(default = "default_audit_max_entries")]
    pub max_entries: usize,

    /// Entries older than this are purged, in seconds
    #[serde(default = "default_audit_retention")]
    pub retention_secs: u64,

    /// Mirror appended entries to the log output
    #[serde(default)]
    pub console_mirror: bool,

    /// Interval between retention purges, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub purge_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: default_audit_max_entries(),
            retention_secs: default_audit_retention(),
            console_mirror: false,
            purge_interval_secs: default_cleanup_interval(),
        }
    }
}

/// Rate limiting configuration shared by OAuth, sandbox, and bus admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity in tokens
    #[serde(default = "default_bucket_capacity")]
    pub capacity: u32,

    /// Refill rate in tokens per second
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_bucket_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, ./warden.toml, and WARDEN_ env vars
    pub fn load() -> Result<Self> {
        Self::load_from("warden.toml")
    }

    /// Load configuration from a specific TOML file
    ///
    /// Useful for testing or non-standard deployments. Environment variables
    /// still take precedence.
    pub fn load_from(path: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("WARDEN_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    ///
    /// Called by `load`/`load_from`; call it directly when constructing a
    /// `Config` in code.
    pub fn validate(&self) -> Result<()> {
        if self.oauth.auth_code_ttl_secs == 0 || self.oauth.auth_code_ttl_secs > 60 {
            return Err(Error::Validation(format!(
                "oauth.auth_code_ttl_secs must be in 1..=60, got {}",
                self.oauth.auth_code_ttl_secs
            )));
        }
        for alg in &self.oauth.dpop_algs {
            if alg != "ES256" && alg != "RS256" {
                return Err(Error::Validation(format!(
                    "oauth.dpop_algs entry '{}' is not supported",
                    alg
                )));
            }
        }
        if self.oauth.allowed_scopes.is_empty() {
            return Err(Error::Validation(
                "oauth.allowed_scopes must not be empty".to_string(),
            ));
        }

        if self.sandbox.max_concurrent_executions == 0 {
            return Err(Error::Validation(
                "sandbox.max_concurrent_executions must be positive".to_string(),
            ));
        }
        if self.sandbox.default_timeout_ms > self.sandbox.max_timeout_ms {
            return Err(Error::Validation(format!(
                "sandbox.default_timeout_ms {} exceeds hard cap {}",
                self.sandbox.default_timeout_ms, self.sandbox.max_timeout_ms
            )));
        }
        if self.sandbox.resources.cpus <= 0.0 {
            return Err(Error::Validation(
                "sandbox.resources.cpus must be positive".to_string(),
            ));
        }
        if self.sandbox.resources.pids_limit == 0 {
            return Err(Error::Validation(
                "sandbox.resources.pids_limit must be positive".to_string(),
            ));
        }
        if self.sandbox.resources.memory_swap_bytes < self.sandbox.resources.memory_bytes {
            return Err(Error::Validation(
                "sandbox.resources.memory_swap_bytes must be >= memory_bytes".to_string(),
            ));
        }
        validate_network_policy(&self.sandbox.network)?;

        if self.bus.max_queue_size == 0 {
            return Err(Error::Validation(
                "bus.max_queue_size must be positive".to_string(),
            ));
        }
        if self.bus.default_concurrency == 0 {
            return Err(Error::Validation(
                "bus.default_concurrency must be positive".to_string(),
            ));
        }
        if self.bus.dead_letter_topic.is_empty() {
            return Err(Error::Validation(
                "bus.dead_letter_topic must not be empty".to_string(),
            ));
        }

        if self.audit.max_entries == 0 {
            return Err(Error::Validation(
                "audit.max_entries must be positive".to_string(),
            ));
        }

        if self.rate_limit.capacity == 0 {
            return Err(Error::Validation(
                "rate_limit.capacity must be positive".to_string(),
            ));
        }
        if self.rate_limit.refill_per_sec <= 0.0 {
            return Err(Error::Validation(
                "rate_limit.refill_per_sec must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Reject a network policy that enables networking without naming any host
///
/// Shared between config validation and per-request validation, since
/// requests may override the network policy.
pub fn validate_network_policy(network: &NetworkPolicy) -> Result<()> {
    if network.enabled && network.allowed_hosts.is_empty() {
        return Err(Error::Validation(
            "network.enabled requires at least one entry in allowed_hosts".to_string(),
        ));
    }
    Ok(())
}

fn default_service_name() -> String {
    "warden".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_issuer() -> String {
    "https://warden.local".to_string()
}

fn default_access_token_ttl() -> u64 {
    3_600
}

fn default_refresh_token_ttl() -> u64 {
    2_592_000
}

fn default_auth_code_ttl() -> u64 {
    60
}

fn default_allowed_scopes() -> Vec<String> {
    vec!["read".to_string(), "write".to_string()]
}

fn default_dpop_algs() -> Vec<String> {
    vec!["ES256".to_string(), "RS256".to_string()]
}

fn default_dpop_max_age() -> i64 {
    300
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_revoked_family_high_water() -> usize {
    10_000
}

fn default_authorization_endpoint() -> String {
    "/oauth/authorize".to_string()
}

fn default_token_endpoint() -> String {
    "/oauth/token".to_string()
}

fn default_revocation_endpoint() -> String {
    "/oauth/revoke".to_string()
}

fn default_introspection_endpoint() -> String {
    "/oauth/introspect".to_string()
}

fn default_registration_endpoint() -> String {
    "/oauth/register".to_string()
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_code_size() -> usize {
    1_048_576
}

fn default_max_timeout_ms() -> u64 {
    300_000
}

fn default_max_files() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_memory_bytes() -> u64 {
    268_435_456
}

fn default_cpus() -> f64 {
    1.0
}

fn default_pids_limit() -> u64 {
    128
}

fn default_max_output_bytes() -> usize {
    1_048_576
}

fn default_max_file_size_bytes() -> usize {
    1_048_576
}

fn default_sandbox_uid() -> u32 {
    65_534
}

fn default_work_dir() -> String {
    "/workspace".to_string()
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_bash_image() -> String {
    "alpine:3.20".to_string()
}

fn default_python_image() -> String {
    "python:3.12-alpine".to_string()
}

fn default_javascript_image() -> String {
    "node:22-alpine".to_string()
}

fn default_reap_interval() -> u64 {
    60
}

fn default_reap_max_age() -> u64 {
    3_600
}

fn default_retain_count() -> usize {
    100
}

fn default_retain_duration_ms() -> i64 {
    3_600_000
}

fn default_max_subscribers() -> usize {
    100
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_dead_letter_topic() -> String {
    "__dead_letter__".to_string()
}

fn default_bus_concurrency() -> usize {
    10
}

fn default_bus_timeout_ms() -> u64 {
    30_000
}

fn default_audit_max_entries() -> usize {
    10_000
}

fn default_audit_retention() -> u64 {
    2_592_000
}

fn default_bucket_capacity() -> u32 {
    60
}

fn default_refill_per_sec() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().expect("default config must be valid");
        assert_eq!(config.oauth.access_token_ttl_secs, 3_600);
        assert_eq!(config.oauth.refresh_token_ttl_secs, 2_592_000);
        assert_eq!(config.sandbox.max_files, 10);
        assert_eq!(config.bus.dead_letter_topic, "__dead_letter__");
        assert_eq!(config.audit.max_entries, 10_000);
    }

    #[test]
    fn network_without_hosts_is_rejected() {
        let mut config = Config::default();
        config.sandbox.network.enabled = true;
        assert!(config.validate().is_err());

        config.sandbox.network.allowed_hosts = vec!["pypi.org".to_string()];
        config.validate().expect("host list makes it valid");
    }

    #[test]
    fn auth_code_ttl_is_capped() {
        let mut config = Config::default();
        config.oauth.auth_code_ttl_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unsupported_dpop_alg_is_rejected() {
        let mut config = Config::default();
        config.oauth.dpop_algs = vec!["HS256".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_timeout_must_fit_hard_cap() {
        let mut config = Config::default();
        config.sandbox.default_timeout_ms = config.sandbox.max_timeout_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pull_policy_serde_uses_kebab_case() {
        let json = serde_json::to_string(&ImagePullPolicy::IfNotPresent).unwrap();
        assert_eq!(json, "\"if-not-present\"");
        let parsed: ImagePullPolicy = serde_json::from_str("\"never\"").unwrap();
        assert_eq!(parsed, ImagePullPolicy::Never);
    }
}
