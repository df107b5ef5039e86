//! Sandboxed job execution.
//!
//! Each job gets an ephemeral workspace directory mounted into a
//! language-pinned container with no network, a read-only root filesystem,
//! dropped capabilities, and cpu/memory quotas. The wall clock is enforced
//! here: the container is killed when the job's timeout elapses.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::protocol::{truncate_utf8, JobLimits};

/// What came out of one job execution. Launch and capture failures are
/// folded into a synthetic non-zero exit so exactly one result is always
/// produced.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Exit code reported when the container had to be killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the container could not be launched at all.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 125;

#[derive(Debug, Clone)]
pub struct JobExecutor {
    sandbox: SandboxConfig,
    workspace_root: PathBuf,
    max_capture_bytes: usize,
}

impl JobExecutor {
    pub fn new(sandbox: SandboxConfig, workspace_root: PathBuf, max_capture_bytes: usize) -> Self {
        Self {
            sandbox,
            workspace_root,
            max_capture_bytes,
        }
    }

    /// Container image pinned per language tag.
    pub fn image_for(language: &str) -> &'static str {
        match language {
            "python" => "python:3.9-slim",
            "javascript" | "node" => "node:18-slim",
            "bash" => "ubuntu:22.04",
            _ => "python:3.9-slim",
        }
    }

    /// Workspace file name and in-container command for a language tag.
    pub fn entrypoint_for(language: &str) -> (&'static str, Vec<&'static str>) {
        match language {
            "javascript" | "node" => ("task.js", vec!["node", "task.js"]),
            "bash" => ("task.sh", vec!["bash", "task.sh"]),
            _ => ("task.py", vec!["python", "task.py"]),
        }
    }

    /// Run a job to completion. Never fails: every error path yields a
    /// result with a synthetic exit code and the error text on stderr.
    pub async fn execute(
        &self,
        job_id: Uuid,
        language: &str,
        code: &str,
        limits: &JobLimits,
    ) -> ExecutionResult {
        let workspace = self.workspace_root.join(job_id.to_string());
        let result = self.run_in_container(job_id, language, code, limits, &workspace).await;

        // The workspace goes away on every exit path.
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = %job_id, error = %e, "Workspace cleanup failed");
            }
        }

        match result {
            Ok(result) => result,
            Err(message) => {
                tracing::error!(job_id = %job_id, error = %message, "Execution failed to launch");
                ExecutionResult {
                    job_id,
                    exit_code: LAUNCH_FAILURE_EXIT_CODE,
                    stdout: String::new(),
                    stderr: message,
                }
            }
        }
    }

    async fn run_in_container(
        &self,
        job_id: Uuid,
        language: &str,
        code: &str,
        limits: &JobLimits,
        workspace: &PathBuf,
    ) -> Result<ExecutionResult, String> {
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| format!("creating workspace: {e}"))?;

        let (file_name, command) = Self::entrypoint_for(language);
        tokio::fs::write(workspace.join(file_name), code)
            .await
            .map_err(|e| format!("writing code file: {e}"))?;

        let container_name = container_name(job_id);
        let args = self.docker_args(&container_name, language, limits, workspace, &command);

        tracing::info!(
            job_id = %job_id,
            language,
            image = Self::image_for(language),
            timeout_s = limits.timeout_s,
            "Launching container"
        );

        let wall = std::time::Duration::from_secs(limits.timeout_s);
        let mut command = Command::new("docker");
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(wall, command.output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);
                tracing::info!(job_id = %job_id, exit_code, "Container exited");
                Ok(ExecutionResult {
                    job_id,
                    exit_code,
                    stdout: truncate_utf8(&stdout, self.max_capture_bytes).to_string(),
                    stderr: truncate_utf8(&stderr, self.max_capture_bytes).to_string(),
                })
            }
            Ok(Err(e)) => Err(format!("launching container: {e}")),
            Err(_) => {
                tracing::warn!(job_id = %job_id, timeout_s = limits.timeout_s, "Wall clock elapsed; killing container");
                self.kill(job_id).await;
                Ok(ExecutionResult {
                    job_id,
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!("timeout: killed after {}s", limits.timeout_s),
                })
            }
        }
    }

    /// Best-effort kill of a job's container (cancel or timeout path).
    pub async fn kill(&self, job_id: Uuid) {
        let name = container_name(job_id);
        if let Err(e) = Command::new("docker").args(["kill", &name]).output().await {
            tracing::debug!(job_id = %job_id, error = %e, "docker kill failed");
        }
    }

    fn docker_args(
        &self,
        container_name: &str,
        language: &str,
        limits: &JobLimits,
        workspace: &PathBuf,
        command: &[&str],
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={container_name}"),
            format!("--user={}", self.sandbox.user),
            "--workdir=/workspace".to_string(),
            format!("--volume={}:/workspace:rw", workspace.display()),
        ];

        if self.sandbox.network_disabled {
            args.push("--network=none".to_string());
        }
        if self.sandbox.read_only_root {
            args.push("--read-only".to_string());
            args.push("--tmpfs=/tmp:rw,noexec,nosuid,size=100m".to_string());
        }
        if self.sandbox.drop_capabilities {
            args.push("--cap-drop=ALL".to_string());
            args.push("--security-opt=no-new-privileges".to_string());
        }

        args.push(format!("--cpus={}", limits.cpu_cores));
        args.push(format!("--memory={}m", limits.memory_mb));

        args.push(Self::image_for(language).to_string());
        args.extend(command.iter().map(|s| s.to_string()));
        args
    }
}

fn container_name(job_id: Uuid) -> String {
    format!("gridx-job-{job_id}")
}
