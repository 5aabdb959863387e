//! Sandbox execution orchestrator
//!
//! Admits requests under a concurrency cap, drives the container runtime
//! through the full lifecycle, records every admitted execution in the audit
//! trail, and announces outcomes on the event bus. Every path out of an
//! admitted execution releases the slot and removes the container.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::request::{
    env_map, merge_profile, truncate_output, validate_request, ExecutionRequest, ExecutionResult,
};
use crate::audit::{code_hash_prefix, AuditEntry, AuditLog, AuditSeverity};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::{ImagePullPolicy, SandboxConfig};
use crate::error::{Error, Result, SandboxError, SandboxErrorKind};
use crate::runtime::{
    ContainerLogs, ContainerRuntime, ContainerStats, ExecutionProfile, ExitStatus, LaunchSpec,
    WorkspaceFile,
};

struct InFlight {
    container_id: Mutex<Option<String>>,
    cancel: CancellationToken,
}

enum Outcome {
    Exited(ExitStatus, ContainerLogs, ContainerStats),
    TimedOut(ContainerLogs, ContainerStats),
    Cancelled,
    Failed(Error),
}

/// The sandbox orchestrator
pub struct SandboxOrchestrator {
    config: SandboxConfig,
    runtime: Arc<dyn ContainerRuntime>,
    audit: AuditLog,
    bus: Option<EventBus>,
    clock: Arc<dyn Clock>,
    slots: Arc<Semaphore>,
    inflight: DashMap<String, Arc<InFlight>>,
}

impl SandboxOrchestrator {
    /// Create an orchestrator driving `runtime`
    pub fn new(
        config: SandboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_executions));
        Self {
            config,
            runtime,
            audit,
            bus: None,
            clock,
            slots,
            inflight: DashMap::new(),
        }
    }

    /// Announce execution outcomes on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Number of currently admitted executions
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Execute untrusted code
    ///
    /// Timeouts and OOM kills are results, not errors; infrastructure
    /// failures (pull, create, start, internal) are errors with
    /// distinguishable codes.
    pub async fn execute(&self, mut request: ExecutionRequest) -> Result<ExecutionResult> {
        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        request.execution_id = Some(execution_id.clone());

        validate_request(&request, &self.config)?;

        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            return Err(Error::Sandbox(SandboxError::new(
                SandboxErrorKind::TooManyExecutions,
                format!(
                    "concurrency cap of {} reached",
                    self.config.max_concurrent_executions
                ),
            )));
        };

        let profile = merge_profile(&self.config, request.config.as_ref());
        let entry = Arc::new(InFlight {
            container_id: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        self.inflight.insert(execution_id.clone(), entry.clone());
        let started = self.clock.now_ms();

        let outcome = self.run(&request, &execution_id, &profile, &entry).await;

        // Teardown happens on every path: remove the container, release the
        // slot, drop the in-flight entry.
        let container_id = entry
            .container_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(ref cid) = container_id {
            if let Err(e) = self.runtime.remove(cid).await {
                tracing::warn!(container = %cid, error = %e, "container removal failed");
            }
        }
        self.inflight.remove(&execution_id);
        drop(permit);

        let completed = self.clock.now_ms();
        let duration_ms = completed.saturating_sub(started).max(0) as u64;

        self.settle(
            &request,
            &execution_id,
            &profile,
            outcome,
            container_id,
            started,
            completed,
            duration_ms,
        )
        .await
    }

    /// Cancel an in-flight execution
    ///
    /// Idempotent and safe to race with completion: whichever side wins
    /// removes the container.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let Some(entry) = self.inflight.get(execution_id).map(|e| e.clone()) else {
            return Ok(false);
        };
        entry.cancel.cancel();

        let container_id = entry
            .container_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(ref cid) = container_id {
            if let Err(e) = self.runtime.stop(cid).await {
                tracing::warn!(container = %cid, error = %e, "cancel stop failed");
            }
            if let Err(e) = self.runtime.remove(cid).await {
                tracing::warn!(container = %cid, error = %e, "cancel remove failed");
            }
        }
        tracing::info!(execution = %execution_id, "execution cancelled");
        Ok(true)
    }

    /// Reap containers older than the configured age
    pub async fn reap_stale(&self) -> Result<usize> {
        let cutoff = self.clock.now_ms() - (self.config.reap_max_age_secs as i64) * 1_000;
        self.runtime.reap(cutoff).await
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        execution_id: &str,
        profile: &ExecutionProfile,
        entry: &Arc<InFlight>,
    ) -> Outcome {
        let image = self.image_for(request);
        if let Err(e) = self.ensure_image(&image, profile).await {
            return Outcome::Failed(e);
        }

        let spec = self.launch_spec(request, execution_id, &image);
        let container_id = match self.runtime.create_container(&spec, profile).await {
            Ok(id) => id,
            Err(e) => return Outcome::Failed(e),
        };
        *entry
            .container_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(container_id.clone());

        if entry.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        if let Err(e) = self.runtime.start(&container_id).await {
            return Outcome::Failed(e);
        }

        let waited = tokio::select! {
            _ = entry.cancel.cancelled() => return Outcome::Cancelled,
            result = self.runtime.wait_for_exit(&container_id, profile.timeout_ms) => result,
        };

        let (logs, stats) = self.collect(&container_id).await;
        match waited {
            Ok(status) => Outcome::Exited(status, logs, stats),
            Err(e) if e.sandbox_kind() == Some(SandboxErrorKind::ExecutionTimeout) => {
                Outcome::TimedOut(logs, stats)
            }
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn collect(&self, container_id: &str) -> (ContainerLogs, ContainerStats) {
        let logs = match self.runtime.get_logs(container_id).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(container = %container_id, error = %e, "log collection failed");
                ContainerLogs::default()
            }
        };
        let stats = self
            .runtime
            .get_stats(container_id)
            .await
            .unwrap_or_default();
        (logs, stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        request: &ExecutionRequest,
        execution_id: &str,
        profile: &ExecutionProfile,
        outcome: Outcome,
        container_id: Option<String>,
        started: i64,
        completed: i64,
        duration_ms: u64,
    ) -> Result<ExecutionResult> {
        let max_output = profile.resources.max_output_bytes;

        let mut entry = AuditEntry::execution(execution_id, request.language.to_string(), started);
        entry.user_id = request.user_id.clone();
        entry.tenant_id = request.tenant_id.clone();
        entry.correlation_id = request.correlation_id.clone();
        entry.code_hash = code_hash_prefix(&request.code);
        entry.code_size_bytes = request.code.len();
        entry.container_id = container_id.clone();
        entry.end_time = Some(completed);
        entry.duration_ms = Some(duration_ms);
        entry.network_enabled = profile.network.enabled;
        entry.resource_limits = profile.resources.clone();

        match outcome {
            Outcome::Exited(status, logs, stats) => {
                let (stdout, stdout_bytes) = truncate_output(&logs.stdout, max_output);
                let (stderr, stderr_bytes) = truncate_output(&logs.stderr, max_output);
                let success = status.exit_code == 0 && !status.oom_killed;

                let error = status.oom_killed.then(|| {
                    format!("{}: container killed by memory limit", SandboxErrorKind::ExecutionOom)
                });

                entry.exit_code = Some(status.exit_code);
                entry.success = success;
                entry.oom_killed = status.oom_killed;
                entry.memory_used_bytes = Some(stats.memory_used_bytes);
                entry.stdout_bytes = stdout_bytes;
                entry.stderr_bytes = stderr_bytes;
                entry.error = error.clone();
                if status.oom_killed {
                    entry.severity = AuditSeverity::Warning;
                }
                self.record(entry).await;

                let result = ExecutionResult {
                    execution_id: execution_id.to_string(),
                    success,
                    exit_code: status.exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                    memory_used_bytes: stats.memory_used_bytes,
                    timed_out: false,
                    oom_killed: status.oom_killed,
                    error,
                    container_id,
                    completed_at: completed,
                };
                let topic = if status.oom_killed {
                    "sandbox.execution.oom"
                } else if success {
                    "sandbox.execution.completed"
                } else {
                    "sandbox.execution.failed"
                };
                self.announce(topic, &result).await;
                Ok(result)
            }

            Outcome::TimedOut(logs, stats) => {
                let (stdout, stdout_bytes) = truncate_output(&logs.stdout, max_output);
                let (stderr, stderr_bytes) = truncate_output(&logs.stderr, max_output);
                let error = format!(
                    "{}: execution exceeded {}ms",
                    SandboxErrorKind::ExecutionTimeout,
                    profile.timeout_ms
                );

                entry.success = false;
                entry.timed_out = true;
                entry.memory_used_bytes = Some(stats.memory_used_bytes);
                entry.stdout_bytes = stdout_bytes;
                entry.stderr_bytes = stderr_bytes;
                entry.error = Some(error.clone());
                entry.severity = AuditSeverity::Warning;
                self.record(entry).await;

                let result = ExecutionResult {
                    execution_id: execution_id.to_string(),
                    success: false,
                    exit_code: -1,
                    stdout,
                    stderr,
                    duration_ms,
                    memory_used_bytes: stats.memory_used_bytes,
                    timed_out: true,
                    oom_killed: false,
                    error: Some(error),
                    container_id,
                    completed_at: completed,
                };
                self.announce("sandbox.execution.timeout", &result).await;
                Ok(result)
            }

            Outcome::Cancelled => {
                let error = SandboxError::new(
                    SandboxErrorKind::ExecutionFailed,
                    "execution cancelled by caller",
                );
                entry.success = false;
                entry.error = Some(error.to_string());
                entry.severity = AuditSeverity::Notice;
                self.record(entry).await;
                self.announce_failure(execution_id, &error).await;
                Err(Error::Sandbox(error))
            }

            Outcome::Failed(e) => {
                entry.success = false;
                entry.error = Some(e.to_string());
                entry.severity = AuditSeverity::Error;
                self.record(entry).await;
                if let Error::Sandbox(ref sandbox_error) = e {
                    self.announce_failure(execution_id, sandbox_error).await;
                }
                Err(e)
            }
        }
    }

    async fn ensure_image(&self, image: &str, profile: &ExecutionProfile) -> Result<()> {
        match profile.image_pull_policy {
            ImagePullPolicy::Always => self.runtime.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => {
                if self.runtime.has_image(image).await? {
                    Ok(())
                } else {
                    self.runtime.pull_image(image).await
                }
            }
            ImagePullPolicy::Never => {
                if self.runtime.has_image(image).await? {
                    Ok(())
                } else {
                    Err(Error::Sandbox(SandboxError::new(
                        SandboxErrorKind::ImageNotFound,
                        format!("image '{}' is absent and pulls are disabled", image),
                    )))
                }
            }
        }
    }

    fn image_for(&self, request: &ExecutionRequest) -> String {
        match request.language {
            super::request::Language::Bash => self.config.images.bash.clone(),
            super::request::Language::Python => self.config.images.python.clone(),
            super::request::Language::Javascript => self.config.images.javascript.clone(),
        }
    }

    fn launch_spec(
        &self,
        request: &ExecutionRequest,
        execution_id: &str,
        image: &str,
    ) -> LaunchSpec {
        let mut files = Vec::with_capacity(request.files.len() + 1);
        files.push(WorkspaceFile {
            path: request.language.entry_file().to_string(),
            content: request.code.clone(),
            executable: false,
        });
        files.extend(request.files.iter().cloned());

        LaunchSpec {
            execution_id: execution_id.to_string(),
            language: request.language.to_string(),
            image: image.to_string(),
            command: request.language.command(),
            stdin: request.stdin.clone(),
            env: env_map(request),
            files,
            user_id: request.user_id.clone(),
            tenant_id: request.tenant_id.clone(),
        }
    }

    async fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(entry).await {
            tracing::error!(error = %e, "failed to write execution audit entry");
        }
    }

    async fn announce(&self, topic: &str, result: &ExecutionResult) {
        let Some(ref bus) = self.bus else { return };
        let payload = json!({
            "executionId": result.execution_id,
            "success": result.success,
            "exitCode": result.exit_code,
            "durationMs": result.duration_ms,
            "timedOut": result.timed_out,
            "oomKilled": result.oom_killed,
            "error": result.error,
        });
        if let Err(e) = bus.publish(topic, payload).await {
            tracing::warn!(error = %e, topic, "failed to announce execution outcome");
        }
    }

    async fn announce_failure(&self, execution_id: &str, error: &SandboxError) {
        let Some(ref bus) = self.bus else { return };
        let payload = json!({
            "executionId": execution_id,
            "success": false,
            "error": error.to_string(),
            "code": error.kind.to_string(),
        });
        if let Err(e) = bus.publish("sandbox.execution.failed", payload).await {
            tracing::warn!(error = %e, "failed to announce execution failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditQuery, AuditStore, InMemoryAuditStore};
    use crate::clock::{ManualClock, SystemClock};
    use crate::config::AuditConfig;
    use crate::runtime::testing::{StubRuntime, WaitBehavior};
    use crate::sandbox::request::{ExecOverrides, Language, ResourceOverrides};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    struct Harness {
        orchestrator: Arc<SandboxOrchestrator>,
        stub: Arc<StubRuntime>,
        audit_store: Arc<InMemoryAuditStore>,
        bus: EventBus,
    }

    fn harness_with(config: SandboxConfig, clock: Arc<dyn Clock>) -> Harness {
        let stub = Arc::new(StubRuntime::default());
        let audit_store = Arc::new(InMemoryAuditStore::new(1_000));
        let audit = AuditLog::new(audit_store.clone(), AuditConfig::default(), clock.clone());
        let bus = EventBus::new(crate::config::BusConfig::default(), clock.clone());
        let orchestrator = Arc::new(
            SandboxOrchestrator::new(config, stub.clone(), audit, clock).with_bus(bus.clone()),
        );
        Harness {
            orchestrator,
            stub,
            audit_store,
            bus,
        }
    }

    fn harness() -> Harness {
        harness_with(SandboxConfig::default(), Arc::new(ManualClock::new(0)))
    }

    fn request(language: Language, code: &str) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: None,
            language,
            code: code.to_string(),
            stdin: None,
            env: HashMap::new(),
            files: Vec::new(),
            config: None,
            user_id: Some("u1".to_string()),
            tenant_id: None,
            correlation_id: None,
        }
    }

    async fn audit_entries(h: &Harness) -> Vec<AuditEntry> {
        h.audit_store
            .query(&AuditQuery {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_execution_produces_one_audit_entry() {
        let h = harness();
        h.stub.set_stdout(b"hello\n");

        let result = h
            .orchestrator
            .execute(request(Language::Bash, "echo hello"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
        assert!(!result.timed_out);
        assert!(!result.oom_killed);
        assert!(result.container_id.is_some());

        let entries = audit_entries(&h).await;
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert!(entry.success);
        assert_eq!(entry.language, "bash");
        assert_eq!(entry.code_hash.len(), 16);
        assert_eq!(entry.user_id.as_deref(), Some("u1"));
        assert_eq!(entry.exit_code, Some(0));

        h.bus.drain().await;
        assert_eq!(h.bus.retained("sandbox.execution.completed").len(), 1);

        // The slot and container were released.
        assert_eq!(h.orchestrator.inflight_count(), 0);
        assert_eq!(h.stub.removed_ids().len(), 1);
    }

    #[tokio::test]
    async fn oom_kill_is_a_result_not_an_error() {
        let h = harness();
        h.stub.set_wait(WaitBehavior::Exit(
            ExitStatus {
                exit_code: 137,
                oom_killed: true,
            },
            0,
        ));
        h.stub.memory_used.store(67_108_864, Ordering::SeqCst);

        let mut req = request(Language::Python, "x='a'*10**9");
        req.config = Some(ExecOverrides {
            resources: Some(ResourceOverrides {
                memory_bytes: Some(67_108_864),
                ..Default::default()
            }),
            ..Default::default()
        });

        let result = h.orchestrator.execute(req).await.unwrap();
        assert!(!result.success);
        assert!(result.oom_killed);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, 137);

        let entries = audit_entries(&h).await;
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert!(entries[0].oom_killed);
        assert!(entries[0].memory_used_bytes.unwrap() > 0);
        assert_eq!(entries[0].resource_limits.memory_bytes, 67_108_864);

        h.bus.drain().await;
        assert_eq!(h.bus.retained("sandbox.execution.oom").len(), 1);
    }

    #[tokio::test]
    async fn timeout_is_reported_with_duration() {
        let h = harness_with(SandboxConfig::default(), Arc::new(SystemClock));
        h.stub.set_wait(WaitBehavior::Timeout);

        let mut req = request(Language::Bash, "sleep 60");
        req.config = Some(ExecOverrides {
            timeout_ms: Some(500),
            ..Default::default()
        });

        let result = h.orchestrator.execute(req).await.unwrap();
        assert!(!result.success);
        assert!(result.timed_out);
        assert!(!result.oom_killed);
        assert!(result.duration_ms >= 500);

        let entries = audit_entries(&h).await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].timed_out);

        h.bus.drain().await;
        assert_eq!(h.bus.retained("sandbox.execution.timeout").len(), 1);
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_with_too_many() {
        let mut config = SandboxConfig::default();
        config.max_concurrent_executions = 1;
        let h = harness_with(config, Arc::new(SystemClock));
        h.stub.set_wait(WaitBehavior::Exit(
            ExitStatus {
                exit_code: 0,
                oom_killed: false,
            },
            200,
        ));

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .execute(request(Language::Bash, "sleep 1"))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let err = h
            .orchestrator
            .execute(request(Language::Bash, "echo hi"))
            .await
            .unwrap_err();
        assert_eq!(
            err.sandbox_kind(),
            Some(SandboxErrorKind::TooManyExecutions)
        );

        first.await.unwrap().unwrap();
        // With the slot free again the next request is admitted.
        h.orchestrator
            .execute(request(Language::Bash, "echo hi"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn output_is_truncated_to_the_bound() {
        let h = harness();
        h.stub.set_stdout(&vec![b'a'; 100]);

        let mut req = request(Language::Bash, "yes");
        req.config = Some(ExecOverrides {
            resources: Some(ResourceOverrides {
                max_output_bytes: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        });

        let result = h.orchestrator.execute(req).await.unwrap();
        assert!(result.stdout.starts_with("aaaaaaaaaa"));
        assert!(result.stdout.contains("[truncated, 100 bytes total]"));

        let entries = audit_entries(&h).await;
        assert_eq!(entries[0].stdout_bytes, 100);
    }

    #[tokio::test]
    async fn never_policy_fails_on_missing_image() {
        let mut config = SandboxConfig::default();
        config.image_pull_policy = ImagePullPolicy::Never;
        let h = harness_with(config, Arc::new(ManualClock::new(0)));
        h.stub.image_present.store(false, Ordering::SeqCst);

        let err = h
            .orchestrator
            .execute(request(Language::Python, "print(1)"))
            .await
            .unwrap_err();
        assert_eq!(err.sandbox_kind(), Some(SandboxErrorKind::ImageNotFound));

        // Failure paths still audit.
        let entries = audit_entries(&h).await;
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert!(entries[0].error.as_ref().unwrap().contains("image_not_found"));
    }

    #[tokio::test]
    async fn pull_failure_is_distinguishable_and_audited() {
        let h = harness();
        h.stub.image_present.store(false, Ordering::SeqCst);
        h.stub.fail_pull.store(true, Ordering::SeqCst);

        let err = h
            .orchestrator
            .execute(request(Language::Python, "print(1)"))
            .await
            .unwrap_err();
        assert_eq!(err.sandbox_kind(), Some(SandboxErrorKind::ImagePullFailed));
        assert_eq!(audit_entries(&h).await.len(), 1);

        h.bus.drain().await;
        assert_eq!(h.bus.retained("sandbox.execution.failed").len(), 1);
    }

    #[tokio::test]
    async fn create_and_start_failures_release_the_slot() {
        let h = harness();
        h.stub.fail_create.store(true, Ordering::SeqCst);
        let err = h
            .orchestrator
            .execute(request(Language::Bash, "true"))
            .await
            .unwrap_err();
        assert_eq!(
            err.sandbox_kind(),
            Some(SandboxErrorKind::ContainerCreateFailed)
        );
        assert_eq!(h.orchestrator.inflight_count(), 0);

        h.stub.fail_create.store(false, Ordering::SeqCst);
        h.stub.fail_start.store(true, Ordering::SeqCst);
        let err = h
            .orchestrator
            .execute(request(Language::Bash, "true"))
            .await
            .unwrap_err();
        assert_eq!(
            err.sandbox_kind(),
            Some(SandboxErrorKind::ContainerStartFailed)
        );
        assert_eq!(h.orchestrator.inflight_count(), 0);
        // The created-but-unstarted container was still removed.
        assert_eq!(h.stub.removed_ids().len(), 1);

        assert_eq!(audit_entries(&h).await.len(), 2);
    }

    #[tokio::test]
    async fn cancel_stops_an_inflight_execution() {
        let h = harness_with(SandboxConfig::default(), Arc::new(SystemClock));
        h.stub.set_wait(WaitBehavior::Exit(
            ExitStatus {
                exit_code: 0,
                oom_killed: false,
            },
            10_000,
        ));

        let mut req = request(Language::Bash, "sleep 600");
        req.execution_id = Some("cancel-me".to_string());
        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.execute(req).await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(h.orchestrator.cancel("cancel-me").await.unwrap());

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.sandbox_kind(), Some(SandboxErrorKind::ExecutionFailed));

        // Cancelling an unknown or finished execution reports false.
        assert!(!h.orchestrator.cancel("cancel-me").await.unwrap());
        assert_eq!(audit_entries(&h).await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_runtime() {
        let h = harness();
        let mut req = request(Language::Python, "print(1)");
        req.env.insert("1BAD".to_string(), "v".to_string());

        let err = h.orchestrator.execute(req).await.unwrap_err();
        assert_eq!(err.sandbox_kind(), Some(SandboxErrorKind::InvalidRequest));
        assert!(h.stub.created.lock().unwrap().is_empty());
        assert!(audit_entries(&h).await.is_empty());
    }

    #[tokio::test]
    async fn launch_spec_carries_entry_file_and_labels() {
        let h = harness();
        h.orchestrator
            .execute(request(Language::Python, "print('hi')"))
            .await
            .unwrap();

        let created = h.stub.created.lock().unwrap();
        let spec = &created[0];
        assert_eq!(spec.language, "python");
        assert_eq!(spec.files[0].path, "main.py");
        assert_eq!(spec.files[0].content, "print('hi')");
        assert_eq!(spec.command, vec!["python", "main.py"]);
        assert_eq!(spec.user_id.as_deref(), Some("u1"));
    }
}
