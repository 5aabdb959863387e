//! Sandbox execution orchestration
//!
//! Validates execution requests, enforces the concurrency cap, drives the
//! container runtime, and leaves an audit entry for every admitted
//! execution.

mod orchestrator;
mod request;

pub use orchestrator::SandboxOrchestrator;
pub use request::{
    merge_profile, validate_request, ExecOverrides, ExecutionRequest, ExecutionResult, Language,
    ResourceOverrides,
};
