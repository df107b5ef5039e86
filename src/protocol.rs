//! Wire protocol for worker sessions.
//!
//! Every worker holds one persistent WebSocket to the coordinator; frames are
//! JSON objects tagged by a `type` field. The first frame on a connection
//! must be [`Frame::Auth`]; anything else closes the socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GridError, Result};

/// Capabilities a worker declares when it authenticates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub accelerators: u32,
    /// Declared concurrent-job capacity. Accepted but the scheduler treats
    /// every session as capacity 1.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

fn default_concurrency() -> u32 {
    1
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            memory_mb: 512,
            accelerators: 0,
            concurrency: 1,
        }
    }
}

impl Capabilities {
    /// Whether this worker can run a job with the given limits.
    pub fn satisfies(&self, limits: &JobLimits) -> bool {
        self.cpu_cores >= limits.cpu_cores
            && self.memory_mb >= limits.memory_mb
            && (!limits.accelerator || self.accelerators > 0)
    }
}

/// Resource limits carried by a job: matching requirements for the scheduler
/// and enforcement caps for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLimits {
    pub timeout_s: u64,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub accelerator: bool,
}

fn default_cpu_cores() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    512
}

impl JobLimits {
    pub fn with_timeout(timeout_s: u64) -> Self {
        Self {
            timeout_s,
            cpu_cores: default_cpu_cores(),
            memory_mb: default_memory_mb(),
            accelerator: false,
        }
    }
}

impl Default for JobLimits {
    fn default() -> Self {
        Self::with_timeout(300)
    }
}

/// Live status of a worker session as tracked by the registry and reported
/// in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Connecting,
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Connecting => write!(f, "connecting"),
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Progress phases a worker may report for a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Running,
}

/// A protocol frame. Serialized as a JSON object with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// W->C, must be first on every connection.
    Auth {
        account_id: String,
        secret: String,
        capabilities: Capabilities,
        /// Present on reconnect to resume the same session identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<Uuid>,
    },
    /// C->W
    AuthOk { worker_id: Uuid },
    /// C->W, connection closes after this frame.
    AuthFail { reason: String },
    /// W->C at a fixed cadence.
    Heartbeat {
        timestamp: DateTime<Utc>,
        status: WorkerStatus,
    },
    /// C->W job dispatch.
    Assign {
        job_id: Uuid,
        language: String,
        code: String,
        limits: JobLimits,
    },
    /// W->C response to `assign` or `cancel`.
    Ack {
        job_id: Uuid,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// W->C
    Progress { job_id: Uuid, phase: ProgressPhase },
    /// W->C, at most one per job; duplicates are dropped by the coordinator.
    Result {
        job_id: Uuid,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// C->W best-effort kill request.
    Cancel { job_id: Uuid, reason: String },
    /// C->W liveness probe; workers must reply with `pong`.
    Ping { correlation_id: u64 },
    /// W->C
    Pong { correlation_id: u64 },
}

impl Frame {
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| GridError::Protocol(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| GridError::Protocol(e.to_string()))
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
/// Applied to stdout/stderr captures on both ends of the protocol.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
