//! Tracing initialization
//!
//! Structured logging setup shared by embedders. The kernel itself only
//! emits events; installing a subscriber is the host process's decision,
//! normally once at startup.

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Error, Result};

/// Install the global tracing subscriber
///
/// The filter comes from `RUST_LOG` when set, falling back to the
/// configured service log level. Fails when a subscriber is already
/// installed.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {}", e)))
}
