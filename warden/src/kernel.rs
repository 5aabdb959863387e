//! Kernel assembly and lifecycle
//!
//! Wires the rate limiter, audit trail, event bus, OAuth core, and sandbox
//! orchestrator into one unit, owns the background maintenance tasks
//! (token cleanup, container reaping, audit retention), and provides the
//! process-wide holder with explicit init/shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, InMemoryAuditStore};
use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::oauth::AuthorizationServer;
use crate::ratelimit::RateLimiter;
use crate::runtime::{CliContainerRuntime, ContainerRuntime, TrackedRuntime};
use crate::sandbox::SandboxOrchestrator;

static GLOBAL: Lazy<Mutex<Option<Arc<SecurityKernel>>>> = Lazy::new(|| Mutex::new(None));

/// The assembled trust and execution kernel
pub struct SecurityKernel {
    config: Config,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    audit: AuditLog,
    oauth: Arc<AuthorizationServer>,
    sandbox: Arc<SandboxOrchestrator>,
    rate_limiter: Arc<RateLimiter>,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SecurityKernel {
    /// Assemble a kernel over the CLI container runtime
    pub fn init(config: Config) -> Result<Arc<Self>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let runtime = Arc::new(CliContainerRuntime::new(
            config.sandbox.runtime_binary.clone(),
            clock.clone(),
        )?);
        Self::init_with_runtime(config, runtime)
    }

    /// Assemble a kernel over a caller-provided container runtime
    pub fn init_with_runtime(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let bus = EventBus::new(config.bus.clone(), clock.clone());
        let audit = AuditLog::new(
            Arc::new(InMemoryAuditStore::new(config.audit.max_entries)),
            config.audit.clone(),
            clock.clone(),
        )
        .with_bus(bus.clone());

        let tracked: Arc<dyn ContainerRuntime> = Arc::new(
            TrackedRuntime::new(runtime, clock.clone()).with_bus(bus.clone()),
        );

        let oauth = Arc::new(
            AuthorizationServer::in_memory(config.oauth.clone(), clock.clone())
                .with_audit(audit.clone())
                .with_bus(bus.clone()),
        );
        let sandbox = Arc::new(
            SandboxOrchestrator::new(
                config.sandbox.clone(),
                tracked,
                audit.clone(),
                clock.clone(),
            )
            .with_bus(bus.clone()),
        );
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));

        let kernel = Arc::new(Self {
            config,
            clock,
            bus,
            audit,
            oauth,
            sandbox,
            rate_limiter,
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        kernel.spawn_maintenance();
        Ok(kernel)
    }

    /// The loaded configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared time source
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// The event bus
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// The audit trail
    pub fn audit(&self) -> AuditLog {
        self.audit.clone()
    }

    /// The OAuth core
    pub fn oauth(&self) -> Arc<AuthorizationServer> {
        self.oauth.clone()
    }

    /// The sandbox orchestrator
    pub fn sandbox(&self) -> Arc<SandboxOrchestrator> {
        self.sandbox.clone()
    }

    /// The shared rate limiter
    ///
    /// Callers admit a request for a client/user key before touching the
    /// OAuth endpoints, sandbox submission, or bus publishing.
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    /// Admit one request for `key`, sleeping out any rate-limit wait
    pub async fn admit(&self, key: &str) {
        self.rate_limiter.acquire_and_wait(key).await;
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        let oauth = self.oauth.clone();
        let token = self.shutdown_token.clone();
        let every = Duration::from_secs(self.config.oauth.cleanup_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            run_periodic(token, every, "oauth-cleanup", move || {
                let oauth = oauth.clone();
                async move { oauth.cleanup_expired().await.map(|_| ()) }
            })
            .await;
        }));

        let sandbox = self.sandbox.clone();
        let token = self.shutdown_token.clone();
        let every = Duration::from_secs(self.config.sandbox.reap_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            run_periodic(token, every, "container-reap", move || {
                let sandbox = sandbox.clone();
                async move { sandbox.reap_stale().await.map(|_| ()) }
            })
            .await;
        }));

        let audit = self.audit.clone();
        let token = self.shutdown_token.clone();
        let every = Duration::from_secs(self.config.audit.purge_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            run_periodic(token, every, "audit-retention", move || {
                let audit = audit.clone();
                async move { audit.purge_expired().await.map(|_| ()) }
            })
            .await;
        }));
    }

    /// Stop maintenance tasks and drain the bus
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        self.bus.drain().await;
        tracing::info!("kernel shut down");
    }
}

async fn run_periodic<F, Fut>(
    token: CancellationToken,
    every: Duration,
    name: &'static str,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup stays quiet.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {
                if let Err(e) = job().await {
                    tracing::warn!(task = name, error = %e, "maintenance task failed");
                }
            }
        }
    }
}

/// Initialize the process-wide kernel
///
/// Returns the existing kernel when one is already initialized.
pub fn init_global(config: Config) -> Result<Arc<SecurityKernel>> {
    let mut slot = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(ref kernel) = *slot {
        return Ok(kernel.clone());
    }
    let kernel = SecurityKernel::init(config)?;
    *slot = Some(kernel.clone());
    Ok(kernel)
}

/// The process-wide kernel, if initialized
pub fn global() -> Option<Arc<SecurityKernel>> {
    GLOBAL.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Shut down and drop the process-wide kernel
///
/// Idempotent; a no-op when nothing is initialized.
pub async fn shutdown_global() {
    let kernel = GLOBAL
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(kernel) = kernel {
        kernel.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::StubRuntime;
    use crate::sandbox::{ExecutionRequest, Language};
    use std::collections::HashMap;

    fn stub_kernel() -> Arc<SecurityKernel> {
        SecurityKernel::init_with_runtime(Config::default(), Arc::new(StubRuntime::default()))
            .unwrap()
    }

    #[tokio::test]
    async fn kernel_wires_an_execution_through_audit_and_bus() {
        let kernel = stub_kernel();
        kernel.admit("tenant-a").await;

        let result = kernel
            .sandbox()
            .execute(ExecutionRequest {
                execution_id: None,
                language: Language::Bash,
                code: "echo ok".to_string(),
                stdin: None,
                env: HashMap::new(),
                files: Vec::new(),
                config: None,
                user_id: None,
                tenant_id: None,
                correlation_id: None,
            })
            .await
            .unwrap();
        assert!(result.success);

        kernel.bus().drain().await;
        assert_eq!(
            kernel.bus().retained("sandbox.execution.completed").len(),
            1
        );
        // The audit append was announced as well.
        assert_eq!(kernel.bus().retained("audit.entry.written").len(), 1);

        kernel.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let kernel = stub_kernel();
        kernel.shutdown().await;
        kernel.shutdown().await;
    }

    #[tokio::test]
    async fn rate_limiter_is_shared_and_keyed() {
        let kernel = stub_kernel();
        let limiter = kernel.rate_limiter();
        assert!(limiter.acquire("client-1").is_zero());
        assert_eq!(limiter.len(), 1);
        kernel.shutdown().await;
    }
}
