//! Request/response surface: job submission, status polling, balance and
//! worker queries.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::GridError;
use crate::ledger::{Credits, EntryKind, Ledger};
use crate::protocol::JobLimits;
use crate::registry::{WorkerRegistry, WorkerSnapshot};
use crate::scheduler::Scheduler;
use crate::store::{self, Job, JobState, JobStore};

pub const SUPPORTED_LANGUAGES: &[&str] = &["python", "javascript", "node", "bash"];

const MIN_TIMEOUT_S: u64 = 1;
const MAX_TIMEOUT_S: u64 = 3600;

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Ledger,
    pub store: JobStore,
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub job_cost: Credits,
    pub max_code_bytes: usize,
    pub default_timeout_s: u64,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/workers", get(list_workers))
        .route("/credits/{id}", get(get_credits))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(cors)
        .with_state(state)
}

/// Error envelope for the HTTP surface; maps the error taxonomy onto status
/// codes.
pub struct ApiError(GridError);

impl From<GridError> for ApiError {
    fn from(e: GridError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            GridError::InvalidInput(_) | GridError::IllegalTransition { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            GridError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            GridError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
            }
            GridError::JobNotFound(_) | GridError::WorkerNotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            GridError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            GridError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            GridError::WorkerLost(_)
            | GridError::Database(_)
            | GridError::Protocol(_)
            | GridError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "code": code,
            "timestamp": Utc::now(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub submitter: String,
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub limits: Option<LimitsRequest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitsRequest {
    pub timeout_s: Option<u64>,
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub accelerator: bool,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
    state: JobState,
}

#[derive(Serialize)]
struct JobResponse {
    id: Uuid,
    state: JobState,
    submitter: String,
    language: String,
    assigned_worker: Option<Uuid>,
    stdout: Option<String>,
    stderr: Option<String>,
    exit_code: Option<i32>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            submitter: job.submitter,
            language: job.language,
            assigned_worker: job.assigned_worker,
            stdout: job.stdout,
            stderr: job.stderr,
            exit_code: job.exit_code,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    validate_account_id(&request.submitter)?;
    if request.code.is_empty() {
        return Err(GridError::InvalidInput("code must not be empty".into()).into());
    }
    if request.code.len() > state.max_code_bytes {
        return Err(GridError::InvalidInput(format!(
            "code exceeds maximum size of {} bytes",
            state.max_code_bytes
        ))
        .into());
    }
    if !SUPPORTED_LANGUAGES.contains(&request.language.as_str()) {
        return Err(
            GridError::InvalidInput(format!("unsupported language: {}", request.language)).into(),
        );
    }

    let limits = resolve_limits(request.limits.unwrap_or_default(), state.default_timeout_s);
    let job = Job::new(request.submitter.clone(), request.language, request.code, limits);

    // Debit and job creation commit together; a balance that cannot cover the
    // cost aborts with nothing written.
    let mut uow = state.ledger.unit_of_work().await?;
    let balance = uow.ensure_account(&request.submitter).await?;
    if !uow
        .debit(&request.submitter, state.job_cost, Some(job.id))
        .await?
    {
        uow.rollback().await?;
        return Err(GridError::InsufficientCredits {
            needed: state.job_cost.as_f64(),
            available: balance.as_f64(),
        }
        .into());
    }
    store::create_in(uow.job_conn(), &job).await?;
    uow.commit().await?;

    if let Err(e) = state.scheduler.enqueue(job.id) {
        // Post-commit enqueue failure: compensate with a refund in its own
        // unit of work and surface the job as failed.
        tracing::error!(job_id = %job.id, error = %e, "Enqueue failed; refunding submitter");
        let mut uow = state.ledger.unit_of_work().await?;
        uow.credit(
            &request.submitter,
            state.job_cost,
            Some(job.id),
            EntryKind::Refund,
        )
        .await?;
        store::set_terminal_in(
            uow.job_conn(),
            job.id,
            JobState::Failed,
            "",
            "submission accepted but scheduling failed",
            -1,
        )
        .await?;
        uow.commit().await?;
        return Err(e.into());
    }

    tracing::info!(job_id = %job.id, submitter = %request.submitter, "Job submitted");
    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job.id,
            state: JobState::Queued,
        }),
    ))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let id = validate_job_id(&id)?;
    let job = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| GridError::JobNotFound(id.to_string()))?;
    Ok(Json(job.into()))
}

#[derive(Deserialize)]
struct ListJobsQuery {
    submitter: String,
    limit: Option<u32>,
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<JobResponse>>> {
    validate_account_id(&query.submitter)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let jobs = state.store.list_by_submitter(&query.submitter, limit).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = validate_job_id(&id)?;
    if state.store.get(id).await?.is_none() {
        return Err(GridError::JobNotFound(id.to_string()).into());
    }
    state.scheduler.cancel_queued(id).await?;
    Ok(Json(json!({ "job_id": id, "state": "cancelled" })))
}

#[derive(Serialize)]
struct WorkersResponse {
    workers: Vec<WorkerSnapshot>,
}

async fn list_workers(State(state): State<ApiState>) -> Json<WorkersResponse> {
    Json(WorkersResponse {
        workers: state.registry.snapshot(),
    })
}

async fn get_credits(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_account_id(&id)?;
    let balance = state.ledger.ensure_account(&id).await?;
    Ok(Json(json!({
        "account_id": id,
        "balance": balance.as_f64(),
        "timestamp": Utc::now(),
    })))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "ts": Utc::now() }))
}

async fn status(State(state): State<ApiState>) -> ApiResult<Json<serde_json::Value>> {
    let workers = state.registry.snapshot();
    let active = workers
        .iter()
        .filter(|w| {
            matches!(
                w.status,
                crate::protocol::WorkerStatus::Idle | crate::protocol::WorkerStatus::Busy
            )
        })
        .count();
    let jobs: serde_json::Map<String, serde_json::Value> = state
        .store
        .counts_by_state()
        .await?
        .into_iter()
        .map(|(state, n)| (state.to_string(), json!(n)))
        .collect();
    Ok(Json(json!({
        "workers": { "total": workers.len(), "active": active },
        "queue_size": state.scheduler.queue_len(),
        "jobs": jobs,
        "timestamp": Utc::now(),
    })))
}

/// Account ids are 1-64 chars of `[A-Za-z0-9_-]`.
pub fn validate_account_id(id: &str) -> Result<(), GridError> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(GridError::InvalidInput(format!("invalid account id: {id:?}")))
    }
}

/// Job ids are UUIDv4.
pub fn validate_job_id(id: &str) -> Result<Uuid, GridError> {
    let parsed = Uuid::parse_str(id)
        .map_err(|_| GridError::InvalidInput(format!("invalid job id: {id:?}")))?;
    if parsed.get_version_num() != 4 {
        return Err(GridError::InvalidInput(format!(
            "job id is not a v4 UUID: {id:?}"
        )));
    }
    Ok(parsed)
}

fn resolve_limits(request: LimitsRequest, default_timeout_s: u64) -> JobLimits {
    let timeout_s = request
        .timeout_s
        .unwrap_or(default_timeout_s)
        .clamp(MIN_TIMEOUT_S, MAX_TIMEOUT_S);
    let mut limits = JobLimits::with_timeout(timeout_s);
    if let Some(cores) = request.cpu_cores {
        limits.cpu_cores = cores;
    }
    if let Some(memory) = request.memory_mb {
        limits.memory_mb = memory;
    }
    limits.accelerator = request.accelerator;
    limits
}
