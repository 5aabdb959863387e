//! # warden
//!
//! Trust and execution kernel for an agent/automation platform. Every
//! surface that wants to run code or hold a credential goes through the four
//! components assembled here:
//!
//! - **OAuth 2.1 core**: dynamic client registration, PKCE-gated
//!   authorization codes, DPoP-bound access tokens, rotating refresh-token
//!   families with replay detection, introspection and revocation
//! - **Sandbox orchestrator**: resource-capped execution of untrusted code
//!   in disposable containers, with audit logging and lifecycle cleanup
//! - **Event bus**: topic-based pub/sub with retained events, per-subscription
//!   retry, middleware, and a dead-letter topic
//! - **Token-bucket rate limiter**: the shared admission-control primitive
//!
//! ## Example
//!
//! ```rust,no_run
//! use warden::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     let kernel = SecurityKernel::init(config)?;
//!
//!     kernel.admit("client-42").await;
//!     let client = kernel
//!         .oauth()
//!         .register_client(ClientRegistration {
//!             client_name: "cli".into(),
//!             redirect_uris: vec!["https://app.example/cb".into()],
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("registered {}", client.client_id);
//!
//!     kernel.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod kernel;
pub mod oauth;
pub mod observability;
pub mod ratelimit;
pub mod runtime;
pub mod sandbox;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{AuditEntry, AuditLog, AuditQuery, AuditSeverity, AuditStore};
    pub use crate::bus::{
        EventBus, Middleware, PublishOptions, RetryPolicy, SubscribeOptions, TopicSettings,
    };
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::kernel::SecurityKernel;
    pub use crate::oauth::{
        AuthorizationServer, AuthorizeRequest, ClientRegistration, TokenRequest,
    };
    pub use crate::observability::init_tracing;
    pub use crate::ratelimit::{RateLimiter, TokenBucket};
    pub use crate::runtime::{ContainerRuntime, TrackedRuntime};
    pub use crate::sandbox::{ExecutionRequest, ExecutionResult, SandboxOrchestrator};
}
