use std::path::PathBuf;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Coordinator-side configuration, read from `GRIDX_*` environment variables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub http_port: u16,
    pub stream_port: u16,
    pub db_path: PathBuf,
    pub initial_credits: f64,
    pub job_cost: f64,
    pub worker_reward: f64,
    pub stale_threshold: Duration,
    pub reap_threshold: Duration,
    pub sweep_interval: Duration,
    pub default_timeout: Duration,
    pub cancel_ack_grace: Duration,
    pub max_code_bytes: usize,
    pub max_capture_bytes: usize,
    pub requeue_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            http_port: 8081,
            stream_port: 8080,
            db_path: PathBuf::from("./gridx.db"),
            initial_credits: 100.0,
            job_cost: 1.0,
            worker_reward: 0.8,
            stale_threshold: Duration::from_secs(90),
            reap_threshold: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10),
            default_timeout: Duration::from_secs(300),
            cancel_ack_grace: Duration::from_secs(10),
            max_code_bytes: 1024 * 1024,
            max_capture_bytes: 64 * 1024,
            requeue_attempts: 3,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            http_port: env_or("GRIDX_HTTP_PORT", d.http_port),
            stream_port: env_or("GRIDX_WS_PORT", d.stream_port),
            db_path: std::env::var("GRIDX_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
            initial_credits: env_or("GRIDX_INITIAL_CREDITS", d.initial_credits),
            job_cost: env_or("GRIDX_JOB_COST", d.job_cost),
            worker_reward: env_or("GRIDX_WORKER_REWARD", d.worker_reward),
            stale_threshold: Duration::from_secs(env_or(
                "GRIDX_STALE_THRESHOLD_S",
                d.stale_threshold.as_secs(),
            )),
            reap_threshold: Duration::from_secs(env_or(
                "GRIDX_REAP_THRESHOLD_S",
                d.reap_threshold.as_secs(),
            )),
            sweep_interval: d.sweep_interval,
            default_timeout: Duration::from_secs(env_or(
                "GRIDX_DEFAULT_TIMEOUT_S",
                d.default_timeout.as_secs(),
            )),
            cancel_ack_grace: d.cancel_ack_grace,
            max_code_bytes: env_or("GRIDX_MAX_CODE_BYTES", d.max_code_bytes),
            max_capture_bytes: env_or("GRIDX_MAX_CAPTURE_BYTES", d.max_capture_bytes),
            requeue_attempts: env_or("GRIDX_REQUEUE_ATTEMPTS", d.requeue_attempts),
        }
    }
}

/// Worker-side configuration, assembled from CLI flags plus environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub account_id: String,
    pub secret: String,
    pub coordinator_ip: String,
    pub stream_port: u16,
    pub heartbeat_interval: Duration,
    pub max_capture_bytes: usize,
    pub workspace_root: PathBuf,
}

impl WorkerConfig {
    pub fn stream_url(&self) -> String {
        format!(
            "ws://{}:{}/ws/worker",
            self.coordinator_ip, self.stream_port
        )
    }
}

/// Container sandbox settings applied to every job the worker runs.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub network_disabled: bool,
    pub read_only_root: bool,
    pub drop_capabilities: bool,
    pub user: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_disabled: true,
            read_only_root: true,
            drop_capabilities: true,
            user: "1000:1000".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.http_port, 8081);
        assert_eq!(cfg.stream_port, 8080);
        assert_eq!(cfg.job_cost, 1.0);
        assert_eq!(cfg.worker_reward, 0.8);
        assert_eq!(cfg.stale_threshold, Duration::from_secs(90));
        assert_eq!(cfg.max_code_bytes, 1024 * 1024);
        assert_eq!(cfg.requeue_attempts, 3);
    }

    #[test]
    fn worker_stream_url() {
        let cfg = WorkerConfig {
            account_id: "bob".into(),
            secret: "hunter2".into(),
            coordinator_ip: "10.0.0.5".into(),
            stream_port: 8080,
            heartbeat_interval: Duration::from_secs(15),
            max_capture_bytes: 64 * 1024,
            workspace_root: PathBuf::from("/tmp/gridx"),
        };
        assert_eq!(cfg.stream_url(), "ws://10.0.0.5:8080/ws/worker");
    }
}
