//! Lifecycle tracking around a container runtime
//!
//! Wraps any [`ContainerRuntime`] with the `creating -> created -> running ->
//! stopped -> removed` state machine (plus `error`), announces transitions on
//! the event bus, and implements reaping over the tracked set. The
//! orchestrator always talks to the wrapped runtime.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;

use super::adapter::{
    ContainerLogs, ContainerRuntime, ContainerState, ContainerStats, ExecutionProfile,
    ExitStatus, LaunchSpec,
};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::error::Result;

#[derive(Debug, Clone)]
struct Tracked {
    execution_id: String,
    state: ContainerState,
    created_at_ms: i64,
}

/// State-tracking wrapper over a container runtime
pub struct TrackedRuntime {
    inner: Arc<dyn ContainerRuntime>,
    bus: Option<EventBus>,
    clock: Arc<dyn Clock>,
    containers: DashMap<String, Tracked>,
}

impl TrackedRuntime {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn ContainerRuntime>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            bus: None,
            clock,
            containers: DashMap::new(),
        }
    }

    /// Announce lifecycle transitions on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Current tracked state of a container
    pub fn state(&self, container_id: &str) -> Option<ContainerState> {
        self.containers.get(container_id).map(|c| c.state)
    }

    /// Number of containers currently tracked
    pub fn tracked_count(&self) -> usize {
        self.containers.len()
    }

    async fn transition(&self, container_id: &str, state: ContainerState) {
        let execution_id = match self.containers.get_mut(container_id) {
            Some(mut tracked) => {
                tracked.state = state;
                tracked.execution_id.clone()
            }
            None => return,
        };
        self.announce(container_id, &execution_id, state).await;
    }

    async fn announce(&self, container_id: &str, execution_id: &str, state: ContainerState) {
        let Some(ref bus) = self.bus else {
            return;
        };
        let topic = format!("sandbox.container.{}", state);
        let payload = json!({
            "containerId": container_id,
            "executionId": execution_id,
            "state": state,
        });
        if let Err(e) = bus.publish(&topic, payload).await {
            tracing::warn!(error = %e, topic = %topic, "failed to announce container state");
        }
    }
}

#[async_trait]
impl ContainerRuntime for TrackedRuntime {
    async fn available(&self) -> bool {
        self.inner.available().await
    }

    async fn has_image(&self, image: &str) -> Result<bool> {
        self.inner.has_image(image).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.inner.pull_image(image).await
    }

    async fn create_container(
        &self,
        spec: &LaunchSpec,
        profile: &ExecutionProfile,
    ) -> Result<String> {
        match self.inner.create_container(spec, profile).await {
            Ok(container_id) => {
                self.containers.insert(
                    container_id.clone(),
                    Tracked {
                        execution_id: spec.execution_id.clone(),
                        state: ContainerState::Created,
                        created_at_ms: self.clock.now_ms(),
                    },
                );
                self.announce(&container_id, &spec.execution_id, ContainerState::Created)
                    .await;
                Ok(container_id)
            }
            Err(e) => {
                self.announce("", &spec.execution_id, ContainerState::Error)
                    .await;
                Err(e)
            }
        }
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        match self.inner.start(container_id).await {
            Ok(()) => {
                self.transition(container_id, ContainerState::Running).await;
                Ok(())
            }
            Err(e) => {
                self.transition(container_id, ContainerState::Error).await;
                Err(e)
            }
        }
    }

    async fn wait_for_exit(&self, container_id: &str, timeout_ms: u64) -> Result<ExitStatus> {
        let result = self.inner.wait_for_exit(container_id, timeout_ms).await;
        match &result {
            Ok(_) => self.transition(container_id, ContainerState::Stopped).await,
            // A timeout stops the container; other failures are adapter errors.
            Err(e)
                if e.sandbox_kind() == Some(crate::error::SandboxErrorKind::ExecutionTimeout) =>
            {
                self.transition(container_id, ContainerState::Stopped).await
            }
            Err(_) => self.transition(container_id, ContainerState::Error).await,
        }
        result
    }

    async fn get_logs(&self, container_id: &str) -> Result<ContainerLogs> {
        self.inner.get_logs(container_id).await
    }

    async fn get_stats(&self, container_id: &str) -> Result<ContainerStats> {
        self.inner.get_stats(container_id).await
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let result = self.inner.stop(container_id).await;
        if result.is_ok() {
            self.transition(container_id, ContainerState::Stopped).await;
        }
        result
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let result = self.inner.remove(container_id).await;
        if result.is_ok() {
            if let Some((_, tracked)) = self.containers.remove(container_id) {
                self.announce(container_id, &tracked.execution_id, ContainerState::Removed)
                    .await;
            }
        }
        result
    }

    async fn reap(&self, older_than_ms: i64) -> Result<usize> {
        let stale: Vec<String> = self
            .containers
            .iter()
            .filter(|entry| {
                entry.value().created_at_ms < older_than_ms
                    && entry.value().state != ContainerState::Removed
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0usize;
        for container_id in stale {
            if let Err(e) = self.stop(&container_id).await {
                tracing::warn!(container = %container_id, error = %e, "reap stop failed");
            }
            match self.remove(&container_id).await {
                Ok(()) => reaped += 1,
                Err(e) => {
                    tracing::warn!(container = %container_id, error = %e, "reap remove failed")
                }
            }
        }
        Ok(reaped)
    }
}
