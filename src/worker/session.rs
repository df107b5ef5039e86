//! Worker-side session loop.
//!
//! Connects to the coordinator's stream endpoint, authenticates, then pumps
//! frames: heartbeats out on a timer, assignments in, results back. On
//! transport loss it reconnects with backoff, presenting its assigned
//! worker id to resume the same session identity.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{SandboxConfig, WorkerConfig};
use crate::error::{GridError, Result};
use crate::protocol::{Capabilities, Frame, ProgressPhase, WorkerStatus};
use crate::worker::executor::{ExecutionResult, JobExecutor};
use crate::worker::heartbeat::HeartbeatTicker;

const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// How the worker process ended; maps to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Clean,
    TransportLost,
    AuthRejected,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Clean => 0,
            WorkerExit::TransportLost => 1,
            WorkerExit::AuthRejected => 2,
        }
    }
}

enum SessionEnd {
    Shutdown,
    AuthRejected,
    Dropped,
}

pub struct WorkerClient {
    config: WorkerConfig,
    executor: JobExecutor,
    capabilities: Capabilities,
    worker_id: Mutex<Option<Uuid>>,
    status: Arc<Mutex<WorkerStatus>>,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig) -> Self {
        let executor = JobExecutor::new(
            SandboxConfig::default(),
            config.workspace_root.clone(),
            config.max_capture_bytes,
        );
        Self {
            config,
            executor,
            capabilities: detect_capabilities(),
            worker_id: Mutex::new(None),
            status: Arc::new(Mutex::new(WorkerStatus::Connecting)),
        }
    }

    /// Connect-and-serve until shutdown, auth rejection, or the reconnect
    /// budget runs out.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerExit {
        let mut attempts = 0u32;
        let mut delay = RECONNECT_INITIAL;
        loop {
            match self.run_session(&shutdown).await {
                Ok(SessionEnd::Shutdown) => return WorkerExit::Clean,
                Ok(SessionEnd::AuthRejected) => return WorkerExit::AuthRejected,
                Ok(SessionEnd::Dropped) => {
                    tracing::warn!("Session dropped");
                    // The coordinator was reachable; start the budget over.
                    attempts = 0;
                    delay = RECONNECT_INITIAL;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Connection attempt failed");
                }
            }
            attempts += 1;
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                tracing::error!(attempts, "Reconnect budget exhausted");
                return WorkerExit::TransportLost;
            }
            tracing::info!(delay_s = delay.as_secs(), "Reconnecting");
            tokio::select! {
                _ = shutdown.cancelled() => return WorkerExit::Clean,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = std::cmp::min(delay.mul_f32(1.5), RECONNECT_MAX);
        }
    }

    async fn run_session(&self, shutdown: &CancellationToken) -> Result<SessionEnd> {
        let url = self.config.stream_url();
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| GridError::Internal(format!("connecting to {url}: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let auth = Frame::Auth {
            account_id: self.config.account_id.clone(),
            secret: self.config.secret.clone(),
            capabilities: self.capabilities.clone(),
            worker_id: *self.worker_id.lock().unwrap(),
        };
        sink.send(Message::Text(auth.to_text()?.into()))
            .await
            .map_err(|e| GridError::Internal(format!("sending auth: {e}")))?;

        // The coordinator answers auth before anything else.
        let reply = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => break Frame::from_text(text.as_str())?,
                Some(Ok(_)) => continue,
                _ => return Ok(SessionEnd::Dropped),
            }
        };
        match reply {
            Frame::AuthOk { worker_id } => {
                *self.worker_id.lock().unwrap() = Some(worker_id);
                tracing::info!(worker_id = %worker_id, account_id = %self.config.account_id, "Authenticated");
            }
            Frame::AuthFail { reason } => {
                tracing::error!(reason, "Authentication rejected");
                return Ok(SessionEnd::AuthRejected);
            }
            other => {
                return Err(GridError::Protocol(format!(
                    "expected auth reply, got {other:?}"
                )))
            }
        }
        *self.status.lock().unwrap() = WorkerStatus::Idle;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let ticker = HeartbeatTicker::new(self.config.heartbeat_interval, Arc::clone(&self.status));
        let heartbeat_tx = out_tx.clone();
        let heartbeat = tokio::spawn(async move { ticker.run(heartbeat_tx).await });

        // Results come back into the session loop over a single-producer
        // channel: one in-flight job at a time.
        let (result_tx, mut result_rx) = mpsc::channel::<ExecutionResult>(1);
        let mut current_job: Option<Uuid> = None;

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                Some(frame) = out_rx.recv() => {
                    let Ok(text) = frame.to_text() else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break SessionEnd::Dropped;
                    }
                }
                Some(result) = result_rx.recv() => {
                    if current_job == Some(result.job_id) {
                        current_job = None;
                        *self.status.lock().unwrap() = WorkerStatus::Idle;
                    }
                    let frame = Frame::Result {
                        job_id: result.job_id,
                        exit_code: result.exit_code,
                        stdout: result.stdout,
                        stderr: result.stderr,
                    };
                    if sink.send(Message::Text(frame.to_text()?.into())).await.is_err() {
                        break SessionEnd::Dropped;
                    }
                }
                message = stream.next() => {
                    let frame = match message {
                        Some(Ok(Message::Text(text))) => match Frame::from_text(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::debug!(error = %e, "Unparseable frame ignored");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break SessionEnd::Dropped,
                        Some(Ok(_)) => continue,
                    };
                    self.handle_frame(frame, &mut current_job, &out_tx, &result_tx).await;
                }
            }
        };

        heartbeat.abort();
        *self.status.lock().unwrap() = WorkerStatus::Connecting;
        Ok(end)
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        current_job: &mut Option<Uuid>,
        out_tx: &mpsc::UnboundedSender<Frame>,
        result_tx: &mpsc::Sender<ExecutionResult>,
    ) {
        match frame {
            Frame::Assign {
                job_id,
                language,
                code,
                limits,
            } => {
                if current_job.is_some() {
                    tracing::warn!(job_id = %job_id, "Assignment while busy; rejecting");
                    let _ = out_tx.send(Frame::Ack {
                        job_id,
                        accepted: false,
                        reason: Some("busy".to_string()),
                    });
                    return;
                }
                *current_job = Some(job_id);
                *self.status.lock().unwrap() = WorkerStatus::Busy;
                let _ = out_tx.send(Frame::Ack {
                    job_id,
                    accepted: true,
                    reason: None,
                });
                let _ = out_tx.send(Frame::Progress {
                    job_id,
                    phase: ProgressPhase::Running,
                });

                let executor = self.executor.clone();
                let result_tx = result_tx.clone();
                tokio::spawn(async move {
                    let result = executor.execute(job_id, &language, &code, &limits).await;
                    let _ = result_tx.send(result).await;
                });
            }
            Frame::Cancel { job_id, reason } => {
                tracing::warn!(job_id = %job_id, reason, "Cancel received");
                self.executor.kill(job_id).await;
                if *current_job == Some(job_id) {
                    *current_job = None;
                    *self.status.lock().unwrap() = WorkerStatus::Idle;
                }
                let _ = out_tx.send(Frame::Ack {
                    job_id,
                    accepted: true,
                    reason: None,
                });
            }
            Frame::Ping { correlation_id } => {
                let _ = out_tx.send(Frame::Pong { correlation_id });
            }
            other => {
                tracing::debug!(frame = ?other, "Unexpected frame from coordinator ignored");
            }
        }
    }
}

fn detect_capabilities() -> Capabilities {
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    let memory_mb = std::env::var("GRIDX_WORKER_MEMORY_MB")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2048);
    Capabilities {
        cpu_cores,
        memory_mb,
        accelerators: 0,
        concurrency: 1,
    }
}
