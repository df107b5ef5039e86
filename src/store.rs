//! Durable job records and their lifecycle.
//!
//! Every state change goes through the transition guard; a job reaches a
//! terminal state exactly once and never leaves it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::protocol::JobLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Assigned => "assigned",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "assigned" => Ok(JobState::Assigned),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(GridError::Internal(format!("unknown job state: {other}"))),
        }
    }

    /// The lifecycle edges the store accepts. Everything else is rejected.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub submitter: String,
    pub language: String,
    pub code: String,
    pub limits: JobLimits,
    pub state: JobState,
    pub assigned_worker: Option<Uuid>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub requeues: u32,
}

impl Job {
    pub fn new(submitter: String, language: String, code: String, limits: JobLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter,
            language,
            code,
            limits,
            state: JobState::Queued,
            assigned_worker: None,
            stdout: None,
            stderr: None,
            exit_code: None,
            created_at: Utc::now(),
            completed_at: None,
            requeues: 0,
        }
    }
}

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, job: &Job) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        create_in(&mut conn, job).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(job_from_row).transpose()
    }

    pub async fn list_by_submitter(&self, submitter: &str, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE submitter = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(submitter)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(job_from_row).collect()
    }

    /// Ids of non-terminal jobs assigned to a session, oldest first.
    pub async fn active_jobs_for_worker(&self, worker_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE assigned_worker = ? \
             AND state IN ('assigned', 'running') ORDER BY created_at",
        )
        .bind(worker_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Uuid::parse_str(&r.get::<String, _>("id"))
                    .map_err(|e| GridError::Internal(format!("corrupt job id: {e}")))
            })
            .collect()
    }

    /// Jobs still `queued`, oldest first. Used to rebuild the ready queue on
    /// coordinator startup.
    pub async fn queued_job_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE state = 'queued' ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Uuid::parse_str(&r.get::<String, _>("id"))
                    .map_err(|e| GridError::Internal(format!("corrupt job id: {e}")))
            })
            .collect()
    }

    /// Every job in `assigned` or `running`, oldest first.
    pub async fn active_job_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE state IN ('assigned', 'running') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Uuid::parse_str(&r.get::<String, _>("id"))
                    .map_err(|e| GridError::Internal(format!("corrupt job id: {e}")))
            })
            .collect()
    }

    pub async fn set_state(&self, id: Uuid, to: JobState) -> Result<JobState> {
        let mut conn = self.pool.acquire().await?;
        transition_in(&mut conn, id, to).await
    }

    pub async fn attach_worker(&self, id: Uuid, worker_id: Uuid) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        attach_worker_in(&mut conn, id, worker_id).await
    }

    pub async fn set_terminal(
        &self,
        id: Uuid,
        state: JobState,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        set_terminal_in(&mut conn, id, state, stdout, stderr, exit_code).await
    }

    /// Per-state job counts for the status endpoint.
    pub async fn counts_by_state(&self) -> Result<Vec<(JobState, u64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                let state = JobState::parse(&r.get::<String, _>("state"))?;
                Ok((state, r.get::<i64, _>("n") as u64))
            })
            .collect()
    }
}

/// Insert a new job row. Shared between the store and the submission
/// unit-of-work.
pub(crate) async fn create_in(conn: &mut SqliteConnection, job: &Job) -> Result<()> {
    let limits = serde_json::to_string(&job.limits)
        .map_err(|e| GridError::Internal(format!("serializing limits: {e}")))?;
    let result = sqlx::query(
        "INSERT INTO jobs (id, submitter, language, code, limits, state, assigned_worker, \
         stdout, stderr, exit_code, created_at, completed_at, requeues) \
         VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, ?, NULL, 0) \
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(job.id.to_string())
    .bind(&job.submitter)
    .bind(&job.language)
    .bind(&job.code)
    .bind(limits)
    .bind(job.state.as_str())
    .bind(job.created_at)
    .execute(conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(GridError::Conflict(format!("job {} already exists", job.id)));
    }
    Ok(())
}

/// Move a job to `to`, enforcing the lifecycle. The write is conditional on
/// the observed state so concurrent movers cannot double-apply an edge.
pub(crate) async fn transition_in(
    conn: &mut SqliteConnection,
    id: Uuid,
    to: JobState,
) -> Result<JobState> {
    let from = current_state(conn, id).await?;
    if !from.can_transition_to(to) {
        return Err(GridError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    let result = sqlx::query("UPDATE jobs SET state = ? WHERE id = ? AND state = ?")
        .bind(to.as_str())
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(GridError::Conflict(format!(
            "job {id} changed state concurrently"
        )));
    }
    Ok(to)
}

pub(crate) async fn attach_worker_in(
    conn: &mut SqliteConnection,
    id: Uuid,
    worker_id: Uuid,
) -> Result<()> {
    sqlx::query("UPDATE jobs SET assigned_worker = ? WHERE id = ?")
        .bind(worker_id.to_string())
        .bind(id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

/// Return a job to the queue after its worker was lost: transition, clear the
/// worker pointer, bump the requeue counter. Returns the new counter.
pub(crate) async fn requeue_in(conn: &mut SqliteConnection, id: Uuid) -> Result<u32> {
    clear_assignment_in(&mut *conn, id).await?;
    sqlx::query("UPDATE jobs SET requeues = requeues + 1 WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    let row = sqlx::query("SELECT requeues FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_one(conn)
        .await?;
    Ok(row.get::<i64, _>(0) as u32)
}

/// Undo an assignment: back to `queued` with no worker pointer. Does not
/// touch the requeue counter.
pub(crate) async fn clear_assignment_in(conn: &mut SqliteConnection, id: Uuid) -> Result<()> {
    transition_in(&mut *conn, id, JobState::Queued).await?;
    sqlx::query("UPDATE jobs SET assigned_worker = NULL WHERE id = ?")
        .bind(id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

pub(crate) async fn set_terminal_in(
    conn: &mut SqliteConnection,
    id: Uuid,
    state: JobState,
    stdout: &str,
    stderr: &str,
    exit_code: i32,
) -> Result<()> {
    if !state.is_terminal() {
        return Err(GridError::Internal(format!(
            "{state} is not a terminal state"
        )));
    }
    transition_in(conn, id, state).await?;
    sqlx::query(
        "UPDATE jobs SET stdout = ?, stderr = ?, exit_code = ?, completed_at = ? WHERE id = ?",
    )
    .bind(stdout)
    .bind(stderr)
    .bind(exit_code)
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(conn)
    .await?;
    Ok(())
}

async fn current_state(conn: &mut SqliteConnection, id: Uuid) -> Result<JobState> {
    let row = sqlx::query("SELECT state FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| GridError::JobNotFound(id.to_string()))?;
    JobState::parse(&row.get::<String, _>("state"))
}

fn job_from_row(row: SqliteRow) -> Result<Job> {
    let id = Uuid::parse_str(&row.get::<String, _>("id"))
        .map_err(|e| GridError::Internal(format!("corrupt job id: {e}")))?;
    let assigned_worker = row
        .get::<Option<String>, _>("assigned_worker")
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| GridError::Internal(format!("corrupt worker id: {e}")))?;
    let limits: JobLimits = serde_json::from_str(&row.get::<String, _>("limits"))
        .map_err(|e| GridError::Internal(format!("corrupt limits: {e}")))?;
    Ok(Job {
        id,
        submitter: row.get("submitter"),
        language: row.get("language"),
        code: row.get("code"),
        limits,
        state: JobState::parse(&row.get::<String, _>("state"))?,
        assigned_worker,
        stdout: row.get("stdout"),
        stderr: row.get("stderr"),
        exit_code: row.get("exit_code"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        requeues: row.get::<i64, _>("requeues") as u32,
    })
}
