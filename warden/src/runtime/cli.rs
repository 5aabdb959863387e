//! CLI-driven container runtime
//!
//! Drives a docker-compatible binary through `tokio::process::Command`. The
//! isolation profile maps onto flags: no-new-privileges, full capability
//! drop, read-only root with a tmpfs workspace, non-root uid/gid, a generated
//! seccomp profile, memory/swap/cpu/pid caps, and no network namespace unless
//! the policy enables one.
//!
//! Inputs are staged on the host and bind-mounted read-only; a shell prelude
//! copies them into the tmpfs workspace and sets executable bits before the
//! interpreter starts.

use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::process::Command;

use super::adapter::{
    ContainerLogs, ContainerRuntime, ContainerStats, ExecutionProfile, ExitStatus, LaunchSpec,
};
use super::seccomp;
use crate::clock::Clock;
use crate::error::{Error, Result, SandboxError, SandboxErrorKind};

const INPUT_MOUNT: &str = "/.warden-input";
const WORKSPACE_TMPFS_SIZE: &str = "64m";

/// Container runtime backed by a docker-compatible CLI
pub struct CliContainerRuntime {
    binary: String,
    /// Holds seccomp profiles and per-execution staging directories
    scratch: tempfile::TempDir,
    /// Containers this process created: id -> created_at unix ms
    containers: DashMap<String, i64>,
    clock: Arc<dyn Clock>,
}

impl CliContainerRuntime {
    /// Create a runtime driving `binary` (e.g. `docker`, `podman`)
    pub fn new(binary: impl Into<String>, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            binary: binary.into(),
            scratch: tempfile::tempdir()?,
            containers: DashMap::new(),
            clock,
        })
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                Error::Sandbox(SandboxError::new(
                    SandboxErrorKind::RuntimeNotAvailable,
                    format!("failed to run {}: {}", self.binary, e),
                ))
            })
    }

    async fn run_expecting(&self, args: &[String], kind: SandboxErrorKind) -> Result<Output> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(Error::Sandbox(SandboxError::new(
                kind,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )))
        }
    }

    fn staging_dir(&self, execution_id: &str) -> PathBuf {
        self.scratch.path().join("staging").join(execution_id)
    }

    async fn stage_inputs(&self, spec: &LaunchSpec) -> Result<PathBuf> {
        let dir = self.staging_dir(&spec.execution_id);
        tokio::fs::create_dir_all(&dir).await?;

        for file in &spec.files {
            let path = dir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, file.content.as_bytes()).await?;
        }
        if let Some(ref stdin) = spec.stdin {
            tokio::fs::write(dir.join(".stdin"), stdin.as_bytes()).await?;
        }
        Ok(dir)
    }

    /// Shell prelude run as pid 1: copy staged inputs into the tmpfs
    /// workspace, mark executables, then exec the real command
    fn entry_command(&self, spec: &LaunchSpec, profile: &ExecutionProfile) -> Vec<String> {
        let mut script = format!(
            "cp -r {}/. {}/ 2>/dev/null || true; cd {}",
            INPUT_MOUNT, profile.work_dir, profile.work_dir
        );
        for file in spec.files.iter().filter(|f| f.executable) {
            script.push_str(&format!("; chmod +x {}", shquote(&file.path)));
        }
        let command = spec
            .command
            .iter()
            .map(|part| shquote(part))
            .collect::<Vec<_>>()
            .join(" ");
        if spec.stdin.is_some() {
            script.push_str(&format!("; exec {} < .stdin", command));
        } else {
            script.push_str(&format!("; exec {}", command));
        }
        vec!["/bin/sh".to_string(), "-c".to_string(), script]
    }

    fn create_args(
        &self,
        spec: &LaunchSpec,
        profile: &ExecutionProfile,
        staging: &std::path::Path,
        seccomp_path: Option<&std::path::Path>,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".to_string(),
            "--name".to_string(),
            container_name(&spec.execution_id),
            "--workdir".to_string(),
            profile.work_dir.clone(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--memory".to_string(),
            profile.resources.memory_bytes.to_string(),
            "--memory-swap".to_string(),
            profile.resources.memory_swap_bytes.to_string(),
            "--cpus".to_string(),
            format!("{}", profile.resources.cpus),
            "--pids-limit".to_string(),
            profile.resources.pids_limit.to_string(),
        ];

        for (key, value) in spec.labels() {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if profile.run_as_non_root {
            args.push("--user".to_string());
            args.push(format!("{}:{}", profile.user_id, profile.group_id));
        }
        if profile.drop_all_capabilities {
            args.push("--cap-drop".to_string());
            args.push("ALL".to_string());
        }
        if profile.read_only_root_fs {
            args.push("--read-only".to_string());
            args.push("--tmpfs".to_string());
            args.push(format!(
                "{}:rw,size={}",
                profile.work_dir, WORKSPACE_TMPFS_SIZE
            ));
        }
        if let Some(path) = seccomp_path {
            args.push("--security-opt".to_string());
            args.push(format!("seccomp={}", path.display()));
        }

        if profile.network.enabled {
            args.push("--network".to_string());
            args.push("bridge".to_string());
            for dns in &profile.network.dns_servers {
                args.push("--dns".to_string());
                args.push(dns.clone());
            }
        } else {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        args.push("--volume".to_string());
        args.push(format!("{}:{}:ro", staging.display(), INPUT_MOUNT));

        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args.extend(self.entry_command(spec, profile));
        args
    }
}

fn container_name(execution_id: &str) -> String {
    let short: String = execution_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    format!("warden-{}", short)
}

fn shquote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '-' | '_'))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Parse sizes like `12.5MiB` from CLI stats output
fn parse_mem(text: &str) -> u64 {
    let text = text.trim();
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let Ok(value) = number.trim().parse::<f64>() else {
        return 0;
    };
    let factor: f64 = match unit.trim() {
        "B" | "" => 1.0,
        "KiB" => 1024.0,
        "kB" | "KB" => 1_000.0,
        "MiB" => 1024.0 * 1024.0,
        "MB" => 1_000_000.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "GB" => 1_000_000_000.0,
        _ => 1.0,
    };
    (value * factor) as u64
}

fn is_gone(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("is not running")
        || lower.contains("already in progress")
}

#[async_trait::async_trait]
impl ContainerRuntime for CliContainerRuntime {
    async fn available(&self) -> bool {
        match self.run(&["version".to_string()]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn has_image(&self, image: &str) -> Result<bool> {
        let output = self
            .run(&[
                "image".to_string(),
                "inspect".to_string(),
                image.to_string(),
            ])
            .await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.run_expecting(
            &["pull".to_string(), image.to_string()],
            SandboxErrorKind::ImagePullFailed,
        )
        .await?;
        tracing::info!(image, "pulled sandbox image");
        Ok(())
    }

    async fn create_container(
        &self,
        spec: &LaunchSpec,
        profile: &ExecutionProfile,
    ) -> Result<String> {
        let staging = self.stage_inputs(spec).await?;

        let seccomp_path = if profile.use_seccomp {
            Some(seccomp::write_profile(
                self.scratch.path(),
                profile.network.enabled,
            )?)
        } else {
            None
        };

        let args = self.create_args(spec, profile, &staging, seccomp_path.as_deref());
        let output = self
            .run_expecting(&args, SandboxErrorKind::ContainerCreateFailed)
            .await?;

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(Error::Sandbox(SandboxError::new(
                SandboxErrorKind::ContainerCreateFailed,
                "runtime did not return a container id".to_string(),
            )));
        }
        self.containers
            .insert(container_id.clone(), self.clock.now_ms());
        tracing::debug!(container = %container_id, execution = %spec.execution_id, "container created");
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.run_expecting(
            &["start".to_string(), container_id.to_string()],
            SandboxErrorKind::ContainerStartFailed,
        )
        .await?;
        Ok(())
    }

    async fn wait_for_exit(&self, container_id: &str, timeout_ms: u64) -> Result<ExitStatus> {
        let wait_args = vec!["wait".to_string(), container_id.to_string()];
        let wait = self.run_expecting(&wait_args, SandboxErrorKind::ExecutionFailed);

        let output =
            match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), wait).await {
                Ok(result) => result?,
                Err(_) => {
                    // Sole authority for forcible stop on timeout.
                    self.stop(container_id).await?;
                    return Err(Error::Sandbox(SandboxError::new(
                        SandboxErrorKind::ExecutionTimeout,
                        format!("execution exceeded {}ms", timeout_ms),
                    )));
                }
            };

        let exit_code = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<i64>()
            .map_err(|e| {
                Error::Sandbox(SandboxError::new(
                    SandboxErrorKind::InternalError,
                    format!("unparseable exit code: {}", e),
                ))
            })?;

        let inspect = self
            .run_expecting(
                &[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.State.OOMKilled}}".to_string(),
                    container_id.to_string(),
                ],
                SandboxErrorKind::InternalError,
            )
            .await?;
        let oom_killed = String::from_utf8_lossy(&inspect.stdout).trim() == "true";

        Ok(ExitStatus {
            exit_code,
            oom_killed,
        })
    }

    async fn get_logs(&self, container_id: &str) -> Result<ContainerLogs> {
        let output = self
            .run_expecting(
                &["logs".to_string(), container_id.to_string()],
                SandboxErrorKind::InternalError,
            )
            .await?;
        Ok(ContainerLogs {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn get_stats(&self, container_id: &str) -> Result<ContainerStats> {
        // Best effort: stats are only reported while the cgroup exists.
        let output = self
            .run(&[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format".to_string(),
                "{{.MemUsage}}".to_string(),
                container_id.to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Ok(ContainerStats::default());
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let used = text.split('/').next().map(parse_mem).unwrap_or(0);
        Ok(ContainerStats {
            memory_used_bytes: used,
        })
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let output = self
            .run(&["kill".to_string(), container_id.to_string()])
            .await?;
        if output.status.success() || is_gone(&String::from_utf8_lossy(&output.stderr)) {
            Ok(())
        } else {
            Err(Error::Sandbox(SandboxError::new(
                SandboxErrorKind::InternalError,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )))
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let output = self
            .run(&[
                "rm".to_string(),
                "--force".to_string(),
                container_id.to_string(),
            ])
            .await?;
        let ok = output.status.success() || is_gone(&String::from_utf8_lossy(&output.stderr));
        if !ok {
            return Err(Error::Sandbox(SandboxError::new(
                SandboxErrorKind::InternalError,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )));
        }
        self.containers.remove(container_id);
        Ok(())
    }

    async fn reap(&self, older_than_ms: i64) -> Result<usize> {
        let stale: Vec<String> = self
            .containers
            .iter()
            .filter(|entry| *entry.value() < older_than_ms)
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
        if reaped > 0 {
            tracing::info!(count = reaped, "reaped stale containers");
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{ImagePullPolicy, NetworkPolicy, ResourceLimits};
    use std::collections::BTreeMap;

    fn profile() -> ExecutionProfile {
        ExecutionProfile {
            timeout_ms: 30_000,
            resources: ResourceLimits::default(),
            network: NetworkPolicy::default(),
            read_only_root_fs: true,
            drop_all_capabilities: true,
            use_seccomp: true,
            run_as_non_root: true,
            user_id: 65_534,
            group_id: 65_534,
            work_dir: "/workspace".to_string(),
            image_pull_policy: ImagePullPolicy::IfNotPresent,
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            execution_id: "11111111-2222-3333-4444-555555555555".to_string(),
            language: "python".to_string(),
            image: "python:3.12-alpine".to_string(),
            command: vec!["python".to_string(), "main.py".to_string()],
            stdin: Some("42\n".to_string()),
            env: BTreeMap::from([("APP_MODE".to_string(), "test".to_string())]),
            files: vec![super::super::adapter::WorkspaceFile {
                path: "main.py".to_string(),
                content: "print(input())".to_string(),
                executable: false,
            }],
            user_id: Some("u1".to_string()),
            tenant_id: None,
        }
    }

    #[test]
    fn create_args_encode_isolation_flags() {
        let runtime = CliContainerRuntime::new("docker", Arc::new(SystemClock)).unwrap();
        let staging = runtime.staging_dir("x");
        let args = runtime.create_args(&spec(), &profile(), &staging, None);

        let joined = args.join(" ");
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--tmpfs /workspace:rw,size=64m"));
        assert!(joined.contains("--user 65534:65534"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--pids-limit 128"));
        assert!(joined.contains("--label warden.execution-id=11111111-2222-3333-4444-555555555555"));
        assert!(joined.contains("--env APP_MODE=test"));
        // Image comes before the entry command.
        let image_pos = args.iter().position(|a| a == "python:3.12-alpine").unwrap();
        assert!(args[image_pos + 1..].contains(&"/bin/sh".to_string()));
    }

    #[test]
    fn network_policy_switches_namespace() {
        let runtime = CliContainerRuntime::new("docker", Arc::new(SystemClock)).unwrap();
        let mut prof = profile();
        prof.network = NetworkPolicy {
            enabled: true,
            allowed_hosts: vec!["pypi.org".to_string()],
            allowed_ports: vec![443],
            dns_servers: vec!["1.1.1.1".to_string()],
        };
        let staging = runtime.staging_dir("x");
        let args = runtime.create_args(&spec(), &prof, &staging, None);
        let joined = args.join(" ");
        assert!(joined.contains("--network bridge"));
        assert!(joined.contains("--dns 1.1.1.1"));
        assert!(!joined.contains("--network none"));
    }

    #[test]
    fn entry_command_pipes_stdin_and_sets_exec_bits() {
        let runtime = CliContainerRuntime::new("docker", Arc::new(SystemClock)).unwrap();
        let mut s = spec();
        s.files.push(super::super::adapter::WorkspaceFile {
            path: "helper.sh".to_string(),
            content: "#!/bin/sh\n".to_string(),
            executable: true,
        });
        let cmd = runtime.entry_command(&s, &profile());
        assert_eq!(cmd[0], "/bin/sh");
        assert_eq!(cmd[1], "-c");
        assert!(cmd[2].contains("chmod +x helper.sh"));
        assert!(cmd[2].contains("exec python main.py < .stdin"));
    }

    #[test]
    fn shquote_escapes_awkward_strings() {
        assert_eq!(shquote("main.py"), "main.py");
        assert_eq!(shquote("a b"), "'a b'");
        assert_eq!(shquote("o'brien"), "'o'\\''brien'");
    }

    #[test]
    fn parse_mem_handles_units() {
        assert_eq!(parse_mem("512B"), 512);
        assert_eq!(parse_mem("2KiB"), 2_048);
        assert_eq!(parse_mem("12.5MiB"), 13_107_200);
        assert_eq!(parse_mem("1GiB"), 1_073_741_824);
        assert_eq!(parse_mem("garbage"), 0);
    }

    #[tokio::test]
    async fn staged_inputs_land_on_disk() {
        let runtime = CliContainerRuntime::new("docker", Arc::new(SystemClock)).unwrap();
        let dir = runtime.stage_inputs(&spec()).await.unwrap();
        let code = tokio::fs::read_to_string(dir.join("main.py")).await.unwrap();
        assert_eq!(code, "print(input())");
        let stdin = tokio::fs::read_to_string(dir.join(".stdin")).await.unwrap();
        assert_eq!(stdin, "42\n");
    }
}
