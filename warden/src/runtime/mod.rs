//! Container runtime adapters
//!
//! [`ContainerRuntime`] is the capability the orchestrator drives;
//! [`CliContainerRuntime`] implements it over a docker-compatible binary, and
//! [`TrackedRuntime`] layers the lifecycle state machine and bus announcements
//! over any implementation.

mod adapter;
mod cli;
pub mod seccomp;
mod tracker;

pub use adapter::{
    ContainerLogs, ContainerRuntime, ContainerState, ContainerStats, ExecutionProfile,
    ExitStatus, LaunchSpec, WorkspaceFile,
};
pub use cli::CliContainerRuntime;
pub use tracker::TrackedRuntime;
