//! Dispatch engine: pairs queued jobs with idle, capability-matching worker
//! sessions and owns every job-state transition past `queued`.
//!
//! Passes run serialized on one task; the rest of the coordinator only sends
//! signals. No lock is held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::ledger::{Credits, EntryKind, Ledger};
use crate::protocol::{truncate_utf8, Frame};
use crate::registry::WorkerRegistry;
use crate::scheduler::queue::ReadyQueue;
use crate::store::{self, JobState, JobStore};

/// Why a dispatch pass is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSignal {
    Enqueued,
    WorkerIdle,
    ResultArrived,
    WorkerLost,
}

pub struct Scheduler {
    store: JobStore,
    ledger: Ledger,
    registry: Arc<WorkerRegistry>,
    queue: Mutex<ReadyQueue>,
    signal_tx: mpsc::UnboundedSender<DispatchSignal>,
    worker_reward: Credits,
    requeue_attempts: u32,
    cancel_ack_grace: Duration,
    max_capture_bytes: usize,
    /// job id -> session awaiting a cancel ack.
    pending_cancels: Mutex<HashMap<Uuid, Uuid>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: JobStore,
        ledger: Ledger,
        registry: Arc<WorkerRegistry>,
        worker_reward: f64,
        requeue_attempts: u32,
        cancel_ack_grace: Duration,
        max_capture_bytes: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DispatchSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            store,
            ledger,
            registry,
            queue: Mutex::new(ReadyQueue::new()),
            signal_tx,
            worker_reward: Credits::from_f64(worker_reward),
            requeue_attempts,
            cancel_ack_grace,
            max_capture_bytes,
            pending_cancels: Mutex::new(HashMap::new()),
        });
        (scheduler, signal_rx)
    }

    /// Consume dispatch signals until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<DispatchSignal>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler draining");
                    break;
                }
                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    tracing::debug!(?signal, "Dispatch pass triggered");
                    if let Err(e) = Self::dispatch_pass(&self).await {
                        tracing::error!(error = %e, "Dispatch pass failed");
                    }
                }
            }
        }
    }

    pub fn signal(&self, signal: DispatchSignal) {
        let _ = self.signal_tx.send(signal);
    }

    /// Admit a freshly committed job to the ready queue. Fails only when the
    /// dispatcher has stopped consuming signals (shutdown).
    pub fn enqueue(&self, job_id: Uuid) -> Result<()> {
        self.queue.lock().unwrap().push_back(job_id);
        if self.signal_tx.send(DispatchSignal::Enqueued).is_err() {
            self.queue.lock().unwrap().remove(job_id);
            return Err(crate::error::GridError::Internal(
                "scheduler is not running".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// One sweep of the queue head. A head whose requirements no live worker
    /// satisfies blocks the queue until one connects.
    async fn dispatch_pass(this: &Arc<Self>) -> Result<()> {
        loop {
            let Some(head) = this.queue.lock().unwrap().peek() else {
                return Ok(());
            };
            let Some(job) = this.store.get(head).await? else {
                this.drop_head(head);
                continue;
            };
            if job.state != JobState::Queued {
                // Cancelled (or otherwise moved on) while waiting.
                this.drop_head(head);
                continue;
            }
            let Some(worker_id) = this.registry.pick_idle(&job.limits) else {
                tracing::debug!(job_id = %head, "No idle worker matches; head stays queued");
                return Ok(());
            };

            let mut uow = this.ledger.unit_of_work().await?;
            store::transition_in(uow.job_conn(), head, JobState::Assigned).await?;
            store::attach_worker_in(uow.job_conn(), head, worker_id).await?;
            uow.commit().await?;

            if this.registry.mark_busy(worker_id).is_err() {
                // Session vanished between pick and commit.
                this.revert_assignment(head).await?;
                continue;
            }

            let assign = Frame::Assign {
                job_id: head,
                language: job.language.clone(),
                code: job.code.clone(),
                limits: job.limits.clone(),
            };
            if this.registry.send_frame(worker_id, assign).is_err() {
                let _ = this.registry.mark_offline(worker_id);
                this.revert_assignment(head).await?;
                continue;
            }

            this.drop_head(head);
            Self::arm_timeout(this, head, worker_id, Duration::from_secs(job.limits.timeout_s));
            tracing::info!(job_id = %head, worker_id = %worker_id, "Job dispatched");
        }
    }

    fn drop_head(&self, expected: Uuid) {
        let mut queue = self.queue.lock().unwrap();
        if queue.peek() == Some(expected) {
            queue.pop();
        }
    }

    /// Undo a committed assignment whose `assign` frame never made it out.
    /// Does not count against the requeue budget.
    async fn revert_assignment(&self, job_id: Uuid) -> Result<()> {
        let mut uow = self.ledger.unit_of_work().await?;
        store::clear_assignment_in(uow.job_conn(), job_id).await?;
        uow.commit().await?;
        Ok(())
    }

    /// Coordinator-authoritative wall clock for one dispatched job.
    fn arm_timeout(this: &Arc<Self>, job_id: Uuid, worker_id: Uuid, timeout: Duration) {
        let scheduler = Arc::clone(this);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = Self::on_timeout(&scheduler, job_id, worker_id, timeout).await {
                tracing::error!(job_id = %job_id, error = %e, "Timeout handling failed");
            }
        });
    }

    async fn on_timeout(
        this: &Arc<Self>,
        job_id: Uuid,
        worker_id: Uuid,
        timeout: Duration,
    ) -> Result<()> {
        let Some(job) = this.store.get(job_id).await? else {
            return Ok(());
        };
        if job.state.is_terminal() || job.assigned_worker != Some(worker_id) {
            return Ok(());
        }

        let stderr = format!("timeout: job exceeded {}s wall clock", timeout.as_secs());
        let mut uow = this.ledger.unit_of_work().await?;
        store::set_terminal_in(uow.job_conn(), job_id, JobState::Failed, "", &stderr, -1).await?;
        uow.commit().await?;
        tracing::warn!(job_id = %job_id, worker_id = %worker_id, "Job timed out");

        this.pending_cancels.lock().unwrap().insert(job_id, worker_id);
        let cancel = Frame::Cancel {
            job_id,
            reason: "wall-clock timeout".to_string(),
        };
        if this.registry.send_frame(worker_id, cancel).is_err() {
            this.pending_cancels.lock().unwrap().remove(&job_id);
            let _ = this.registry.mark_offline(worker_id);
            this.on_worker_lost(worker_id).await?;
            return Ok(());
        }

        // The session is freed on ack, or forced offline after the grace
        // period without one.
        let scheduler = Arc::clone(this);
        let grace = this.cancel_ack_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let unacked = scheduler
                .pending_cancels
                .lock()
                .unwrap()
                .remove(&job_id)
                .is_some();
            if unacked {
                tracing::warn!(worker_id = %worker_id, job_id = %job_id, "Cancel unacknowledged; forcing session offline");
                let _ = scheduler.registry.mark_offline(worker_id);
                if let Err(e) = scheduler.on_worker_lost(worker_id).await {
                    tracing::error!(worker_id = %worker_id, error = %e, "Worker-loss handling failed");
                }
            }
        });
        Ok(())
    }

    /// Handle an `ack` frame from a session.
    pub async fn on_ack(
        &self,
        worker_id: Uuid,
        job_id: Uuid,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<()> {
        if self
            .pending_cancels
            .lock()
            .unwrap()
            .remove(&job_id)
            .is_some()
        {
            let _ = self.registry.mark_idle(worker_id);
            self.signal(DispatchSignal::WorkerIdle);
            return Ok(());
        }
        if accepted {
            return Ok(());
        }
        tracing::warn!(
            job_id = %job_id,
            worker_id = %worker_id,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "Assignment rejected"
        );
        self.requeue_or_fail(job_id).await?;
        let _ = self.registry.mark_idle(worker_id);
        self.signal(DispatchSignal::WorkerIdle);
        Ok(())
    }

    /// Handle a `progress` frame: the worker started running the job.
    pub async fn on_progress(&self, job_id: Uuid) -> Result<()> {
        match self.store.set_state(job_id, JobState::Running).await {
            Ok(_) => Ok(()),
            // Late or duplicate progress after the job moved on.
            Err(crate::error::GridError::IllegalTransition { .. })
            | Err(crate::error::GridError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Handle a `result` frame. Terminal-state writes and the worker reward
    /// commit in one unit of work; duplicates are logged and discarded.
    pub async fn on_result(
        &self,
        worker_id: Uuid,
        owner: &str,
        job_id: Uuid,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> Result<()> {
        let Some(job) = self.store.get(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Result for unknown job discarded");
            return Ok(());
        };
        if job.state.is_terminal() {
            tracing::info!(job_id = %job_id, "Duplicate result discarded");
            let _ = self.registry.mark_idle(worker_id);
            self.signal(DispatchSignal::WorkerIdle);
            return Ok(());
        }
        if job.assigned_worker != Some(worker_id) {
            tracing::warn!(job_id = %job_id, worker_id = %worker_id, "Result from non-assigned session discarded");
            let _ = self.registry.mark_idle(worker_id);
            self.signal(DispatchSignal::WorkerIdle);
            return Ok(());
        }

        let stdout = truncate_utf8(stdout, self.max_capture_bytes);
        let stderr = truncate_utf8(stderr, self.max_capture_bytes);
        let state = if exit_code == 0 {
            JobState::Completed
        } else {
            JobState::Failed
        };

        let mut uow = self.ledger.unit_of_work().await?;
        store::set_terminal_in(uow.job_conn(), job_id, state, stdout, stderr, exit_code).await?;
        if state == JobState::Completed {
            uow.credit(owner, self.worker_reward, Some(job_id), EntryKind::JobReward)
                .await?;
        }
        uow.commit().await?;

        tracing::info!(job_id = %job_id, state = %state, exit_code, "Job finished");
        let _ = self.registry.mark_idle(worker_id);
        self.signal(DispatchSignal::ResultArrived);
        Ok(())
    }

    /// A session went offline (transport drop or stale sweep): re-queue every
    /// job it held.
    pub async fn on_worker_lost(&self, worker_id: Uuid) -> Result<()> {
        let held = self.store.active_jobs_for_worker(worker_id).await?;
        for job_id in held {
            tracing::warn!(job_id = %job_id, worker_id = %worker_id, "Worker lost mid-job");
            self.requeue_or_fail(job_id).await?;
        }
        self.signal(DispatchSignal::WorkerLost);
        Ok(())
    }

    /// Re-queue a job (no refund, no re-debit), or fail it once the budget is
    /// spent. The submitter is not refunded on exhaustion.
    async fn requeue_or_fail(&self, job_id: Uuid) -> Result<()> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(());
        };
        if job.state.is_terminal() || job.state == JobState::Queued {
            return Ok(());
        }

        let mut uow = self.ledger.unit_of_work().await?;
        if job.requeues >= self.requeue_attempts {
            store::set_terminal_in(
                uow.job_conn(),
                job_id,
                JobState::Failed,
                "",
                "worker lost: re-queue attempts exhausted",
                -1,
            )
            .await?;
            uow.commit().await?;
            tracing::warn!(job_id = %job_id, attempts = job.requeues, "Re-queue budget exhausted; job failed");
        } else {
            store::requeue_in(uow.job_conn(), job_id).await?;
            uow.commit().await?;
            self.queue.lock().unwrap().push_front(job_id);
            tracing::info!(job_id = %job_id, attempt = job.requeues + 1, "Job re-queued");
        }
        Ok(())
    }

    /// Administrative cancel; legal only while the job is still queued.
    pub async fn cancel_queued(&self, job_id: Uuid) -> Result<()> {
        self.store.set_state(job_id, JobState::Cancelled).await?;
        self.queue.lock().unwrap().remove(job_id);
        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    /// Startup recovery: rebuild the ready queue from persisted `queued`
    /// jobs and re-queue jobs stranded in `assigned`/`running` by a restart.
    pub async fn recover(&self) -> Result<()> {
        for job_id in self.store.queued_job_ids().await? {
            self.queue.lock().unwrap().push_back(job_id);
        }
        for job_id in self.store.active_job_ids().await? {
            tracing::warn!(job_id = %job_id, "Recovering job stranded by restart");
            self.requeue_or_fail(job_id).await?;
        }
        let queued = self.queue_len();
        if queued > 0 {
            tracing::info!(queued, "Ready queue rebuilt from store");
        }
        self.signal(DispatchSignal::Enqueued);
        Ok(())
    }
}

