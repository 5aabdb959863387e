//! Error types and wire-level error codes
//!
//! OAuth and sandbox failures carry a machine-readable kind whose `Display`
//! form is the exact code surfaced at the boundary. Bus delivery failures are
//! retried and dead-lettered instead of being raised to publishers; only
//! pre-delivery failures (queue bounds, subscriber caps, middleware) surface
//! as errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// OAuth errors
// ============================================================================

/// OAuth error codes as surfaced in token/authorize error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OAuthErrorKind {
    /// Unknown client or failed client authentication
    InvalidClient,
    /// Malformed or inconsistent request parameters
    InvalidRequest,
    /// Invalid, expired, consumed, or mismatched grant material
    InvalidGrant,
    /// Requested scope is empty after intersection with allowed scopes
    InvalidScope,
    /// Response type other than `code`
    UnsupportedResponseType,
    /// Grant type outside {authorization_code, refresh_token}
    UnsupportedGrantType,
    /// DPoP proof failed structural or cryptographic validation
    InvalidDpopProof,
}

impl fmt::Display for OAuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidClient => write!(f, "invalid_client"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::InvalidGrant => write!(f, "invalid_grant"),
            Self::InvalidScope => write!(f, "invalid_scope"),
            Self::UnsupportedResponseType => write!(f, "unsupported_response_type"),
            Self::UnsupportedGrantType => write!(f, "unsupported_grant_type"),
            Self::InvalidDpopProof => write!(f, "invalid_dpop_proof"),
        }
    }
}

/// Structured OAuth error with an optional human-readable description
///
/// The description never contains token material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthError {
    /// Wire-level error code
    pub kind: OAuthErrorKind,
    /// Short description safe to return to the caller
    pub description: Option<String>,
}

impl OAuthError {
    /// Create a new OAuth error
    pub fn new(kind: OAuthErrorKind) -> Self {
        Self {
            kind,
            description: None,
        }
    }

    /// Create a new OAuth error with a description
    pub fn with_description(kind: OAuthErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: Some(description.into()),
        }
    }

    /// Shorthand for `invalid_client`
    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::with_description(OAuthErrorKind::InvalidClient, description)
    }

    /// Shorthand for `invalid_request`
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::with_description(OAuthErrorKind::InvalidRequest, description)
    }

    /// Shorthand for `invalid_grant`
    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::with_description(OAuthErrorKind::InvalidGrant, description)
    }

    /// Shorthand for `invalid_scope`
    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::with_description(OAuthErrorKind::InvalidScope, description)
    }

    /// Shorthand for `invalid_dpop_proof`
    pub fn invalid_dpop_proof(description: impl Into<String>) -> Self {
        Self::with_description(OAuthErrorKind::InvalidDpopProof, description)
    }

    /// Convert into the wire-level response body
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.kind.to_string(),
            error_description: self.description.clone(),
        }
    }
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref d) = self.description {
            write!(f, ": {}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for OAuthError {}

// ============================================================================
// Sandbox errors
// ============================================================================

/// Sandbox failure categories
///
/// Pull, create, start, and internal failures are distinguishable so callers
/// can tell an environment problem from a code problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxErrorKind {
    /// Structurally invalid execution request
    InvalidRequest,
    /// Language outside the supported set
    InvalidLanguage,
    /// Submitted code exceeds the hard size cap
    CodeTooLarge,
    /// Image absent and the pull policy forbids pulling
    ImageNotFound,
    /// Image pull was attempted and failed
    ImagePullFailed,
    /// Container creation failed
    ContainerCreateFailed,
    /// Container start failed
    ContainerStartFailed,
    /// Execution exceeded its timeout and was stopped
    ExecutionTimeout,
    /// Execution was killed by the memory limit
    ExecutionOom,
    /// Execution failed (non-zero exit or runtime fault)
    ExecutionFailed,
    /// Output exceeded the configured bound
    OutputTooLarge,
    /// Concurrency cap reached
    TooManyExecutions,
    /// The container runtime is not reachable
    RuntimeNotAvailable,
    /// Unexpected internal failure
    InternalError,
}

impl fmt::Display for SandboxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::InvalidLanguage => write!(f, "invalid_language"),
            Self::CodeTooLarge => write!(f, "code_too_large"),
            Self::ImageNotFound => write!(f, "image_not_found"),
            Self::ImagePullFailed => write!(f, "image_pull_failed"),
            Self::ContainerCreateFailed => write!(f, "container_create_failed"),
            Self::ContainerStartFailed => write!(f, "container_start_failed"),
            Self::ExecutionTimeout => write!(f, "execution_timeout"),
            Self::ExecutionOom => write!(f, "execution_oom"),
            Self::ExecutionFailed => write!(f, "execution_failed"),
            Self::OutputTooLarge => write!(f, "output_too_large"),
            Self::TooManyExecutions => write!(f, "too_many_executions"),
            Self::RuntimeNotAvailable => write!(f, "runtime_not_available"),
            Self::InternalError => write!(f, "internal_error"),
        }
    }
}

/// Structured sandbox error with operation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxError {
    /// Failure category (stable code)
    pub kind: SandboxErrorKind,
    /// Human-readable message
    pub message: String,
}

impl SandboxError {
    /// Create a new sandbox error
    pub fn new(kind: SandboxErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// True when the failure happened before any container existed
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self.kind,
            SandboxErrorKind::InvalidRequest
                | SandboxErrorKind::InvalidLanguage
                | SandboxErrorKind::CodeTooLarge
                | SandboxErrorKind::TooManyExecutions
        )
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SandboxError {}

// ============================================================================
// Bus errors
// ============================================================================

/// Failures surfaced by the event bus to publishers and subscribers
///
/// Delivery failures are not represented here; they flow through retry and
/// the dead-letter topic.
#[derive(Debug, Error)]
pub enum BusError {
    /// The delayed-event queue is at its configured bound
    #[error("publish queue full for topic '{topic}' (max {max})")]
    QueueFull {
        /// Topic the publish targeted
        topic: String,
        /// Configured queue bound
        max: usize,
    },

    /// The topic already has its maximum number of subscribers
    #[error("topic '{topic}' is at its subscriber limit ({max})")]
    SubscriberLimit {
        /// Topic the subscribe targeted
        topic: String,
        /// Configured subscriber cap
        max: usize,
    },

    /// The reserved dead-letter topic cannot be deleted or cleared
    #[error("topic '{topic}' is reserved")]
    ReservedTopic {
        /// The reserved topic name
        topic: String,
    },

    /// A middleware failed before delivery began
    #[error("middleware error: {0}")]
    Middleware(String),

    /// Unknown subscription id
    #[error("unknown subscription '{0}'")]
    UnknownSubscription(String),
}

// ============================================================================
// Top-level error
// ============================================================================

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration or request validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// OAuth protocol error
    #[error("{0}")]
    OAuth(OAuthError),

    /// Sandbox execution error
    #[error("{0}")]
    Sandbox(SandboxError),

    /// Event bus error
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Key-value store error
    #[error("Store error: {0}")]
    Store(String),

    /// Audit trail error
    #[error("Audit error: {0}")]
    Audit(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

impl From<OAuthError> for Error {
    fn from(e: OAuthError) -> Self {
        Self::OAuth(e)
    }
}

impl From<SandboxError> for Error {
    fn from(e: SandboxError) -> Self {
        Self::Sandbox(e)
    }
}

impl Error {
    /// The sandbox failure category, if this is a sandbox error
    pub fn sandbox_kind(&self) -> Option<SandboxErrorKind> {
        match self {
            Self::Sandbox(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The OAuth error code, if this is an OAuth error
    pub fn oauth_kind(&self) -> Option<OAuthErrorKind> {
        match self {
            Self::OAuth(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// OAuth wire-level error response body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Error code
    pub error: String,

    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_kind_codes_are_stable() {
        assert_eq!(OAuthErrorKind::InvalidClient.to_string(), "invalid_client");
        assert_eq!(OAuthErrorKind::InvalidGrant.to_string(), "invalid_grant");
        assert_eq!(
            OAuthErrorKind::UnsupportedResponseType.to_string(),
            "unsupported_response_type"
        );
        assert_eq!(
            OAuthErrorKind::InvalidDpopProof.to_string(),
            "invalid_dpop_proof"
        );
    }

    #[test]
    fn sandbox_kind_codes_are_stable() {
        assert_eq!(SandboxErrorKind::CodeTooLarge.to_string(), "code_too_large");
        assert_eq!(
            SandboxErrorKind::ContainerStartFailed.to_string(),
            "container_start_failed"
        );
        assert_eq!(
            SandboxErrorKind::TooManyExecutions.to_string(),
            "too_many_executions"
        );
    }

    #[test]
    fn oauth_error_response_shape() {
        let err = OAuthError::with_description(
            OAuthErrorKind::InvalidGrant,
            "PKCE verification failed",
        );
        let body = err.to_response();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "invalid_grant");
        assert_eq!(json["error_description"], "PKCE verification failed");
    }

    #[test]
    fn error_response_omits_empty_description() {
        let body = OAuthError::new(OAuthErrorKind::InvalidClient).to_response();
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("error_description"));
    }

    #[test]
    fn admission_failures_are_classified() {
        let err = SandboxError::new(SandboxErrorKind::TooManyExecutions, "at cap");
        assert!(err.is_admission_failure());
        let err = SandboxError::new(SandboxErrorKind::ContainerStartFailed, "boom");
        assert!(!err.is_admission_failure());
    }
}
