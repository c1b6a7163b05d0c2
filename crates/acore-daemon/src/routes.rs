//! HTTP surface of the validation service.
//!
//! Stable routes: `GET /health`, `POST /validate`,
//! `GET /validate/active`, `GET /validate/{job_id}`,
//! `GET /validate/{job_id}/log`, `GET /task/{task_id}`.
//!
//! `POST /validate` is blocking-with-queueing: ingestion (path
//! confinement, defensive extraction, sanitization) runs before a job
//! exists, and the call returns only after the job terminates or is
//! refused. Errors map onto a fixed status-code contract, including
//! `429` with `Retry-After: 1` on a full queue and `503` while the
//! pool or credential manager is not ready.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use acore_core::archive::{extract_archive, ArchiveError};
use acore_core::sanitize::sanitize_workspace;
use acore_core::{TaskSpec, Verdict};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{DaemonConfig, DEFAULT_TIMEOUT_S};
use crate::job::{JobId, JobRecord, JobStatus, JobStore};
use crate::persist::{self, PersistLayout};
use crate::pool::{JobParams, SubmitError, WorkerPool};
use crate::token::AccessTokenManager;

/// Shared application state.
pub struct AppState {
    /// Service configuration.
    pub config: Arc<DaemonConfig>,
    /// Job store.
    pub store: Arc<JobStore>,
    /// Persisted layout.
    pub layout: Arc<PersistLayout>,
    /// Worker pool.
    pub pool: Arc<WorkerPool>,
    /// Credential manager.
    pub tokens: Arc<AccessTokenManager>,
}

/// Errors mapped onto the HTTP status contract.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed input (bad path, bad timeout, bad task spec).
    #[error("{0}")]
    BadRequest(String),

    /// Archive path escapes the configured archive root.
    #[error("workspace_archive_path is outside the configured archive root")]
    OutsideArchiveRoot,

    /// Unknown job or task.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Archive exceeds a size/count cap.
    #[error("archive too large: {0}")]
    ArchiveTooLarge(String),

    /// Archive failed post-ingest validation (traversal, symlink).
    #[error("archive rejected: {0}")]
    ArchiveRejected(String),

    /// Queue full.
    #[error("validator is busy; queue is full")]
    Busy,

    /// Pool or credential manager not ready.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::OutsideArchiveRoot => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ArchiveTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ArchiveRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Busy => StatusCode::TOO_MANY_REQUESTS,
            Self::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        if err.is_size_cap() {
            Self::ArchiveTooLarge(err.to_string())
        } else {
            Self::ArchiveRejected(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({"detail": self.to_string()}));
        let mut response = (status, body).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from_static("1"));
        }
        response
    }
}

/// `POST /validate` request body.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Path to the submitted archive (must end in `.zip`).
    pub workspace_archive_path: String,
    /// The task spec document.
    pub task_spec: serde_json::Value,
    /// Per-job timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_s: i64,
    /// Run guest egress self-checks.
    #[serde(default)]
    pub net_checks: bool,
    /// Stream the serial log (reserved; logs are always captured).
    #[serde(default)]
    pub stream_log: bool,
    /// Quiet kernel console.
    #[serde(default = "default_true")]
    pub quiet_kernel: bool,
}

fn default_timeout() -> i64 {
    i64::try_from(DEFAULT_TIMEOUT_S).expect("fits")
}

const fn default_true() -> bool {
    true
}

/// `POST /validate` response body.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    job_id: String,
    task_id: Option<String>,
    result: Option<Verdict>,
    log_url: String,
    log_path: String,
    submission_path: String,
    tap_device: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sandbox_ready: bool,
    token_ready: bool,
    queue_depth: usize,
    workers_total: usize,
    workers_idle: usize,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ActiveJob {
    job_id: String,
    status: JobStatus,
    log_url: String,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    tail: Option<usize>,
}

/// Builds the router over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/validate", post(submit))
        .route("/validate/active", get(active))
        .route("/validate/:job_id", get(job_status))
        .route("/validate/:job_id/log", get(job_log))
        .route("/task/:task_id", get(task_records))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pool = state.pool.health();
    let token = state.tokens.status();
    Json(HealthResponse {
        status: "healthy",
        sandbox_ready: true,
        token_ready: token.ready,
        queue_depth: pool.queue_depth,
        workers_total: pool.workers_total,
        workers_idle: pool.workers_idle,
        timestamp: Utc::now(),
    })
}

/// Resolves and confines the archive path.
fn resolve_archive_path(config: &DaemonConfig, raw: &str) -> Result<PathBuf, ApiError> {
    if !raw.to_lowercase().ends_with(".zip") {
        return Err(ApiError::BadRequest(
            "workspace_archive_path must end with .zip".to_string(),
        ));
    }
    let path = Path::new(raw);
    if !path.is_file() {
        return Err(ApiError::BadRequest(format!(
            "workspace_archive_path is not a regular file: {raw}"
        )));
    }
    let canonical = path
        .canonicalize()
        .map_err(|e| ApiError::BadRequest(format!("cannot resolve archive path: {e}")))?;

    if let Some(root) = &config.archive_root {
        let root = root
            .canonicalize()
            .map_err(|e| ApiError::Internal(format!("cannot resolve archive root: {e}")))?;
        if !canonical.starts_with(&root) {
            return Err(ApiError::OutsideArchiveRoot);
        }
    }
    Ok(canonical)
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    state.store.prune(state.config.job_ttl);

    // Readiness gates first: a not-ready pool must not cost the caller
    // an ingestion pass.
    if state.tokens.current_token().await.is_err() {
        return Err(ApiError::NotReady(
            "credential manager has no valid token".to_string(),
        ));
    }

    let timeout = state
        .config
        .validate_timeout(request.timeout_s)
        .map_err(ApiError::BadRequest)?;
    let archive_path = resolve_archive_path(&state.config, &request.workspace_archive_path)?;
    let task_spec = TaskSpec::from_value(request.task_spec)
        .map_err(|e| ApiError::BadRequest(format!("task_spec rejected: {e}")))?;
    let task_id = task_spec.task_id.clone();

    let job_id = JobId::new();
    let request_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();

    // Persist the submission before ingestion so a stored artifact
    // exists for every job that ever becomes visible.
    let submission_path = state
        .layout
        .persist_submission(&archive_path, task_id.as_deref(), job_id)
        .map_err(|e| ApiError::Internal(format!("cannot persist submission: {e}")))?;

    // Ingestion: extract defensively, then sanitize. Failures are
    // synchronous and leave no job behind.
    let workspace_dir = state.layout.workspace_dir(job_id);
    let ingest = {
        let archive = submission_path.clone();
        let workspace = workspace_dir.clone();
        let limits = state.config.archive_limits.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ApiError> {
            extract_archive(&archive, &workspace, &limits)?;
            sanitize_workspace(&workspace)
                .map_err(|e| ApiError::Internal(format!("sanitize failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| ApiError::Internal(format!("ingestion task failed: {e}")))?
    };
    if let Err(err) = ingest {
        let _ = std::fs::remove_dir_all(&workspace_dir);
        return Err(err);
    }

    let log_path = state.layout.log_path(task_id.as_deref(), job_id);
    let record = JobRecord {
        job_id,
        task_id: task_id.clone(),
        status: JobStatus::Queued,
        seq: state.store.next_seq(),
        enqueued_at: Utc::now(),
        started_at: None,
        finished_at: None,
        task_spec,
        submission_path: submission_path.clone(),
        log_path: log_path.clone(),
        result: None,
        error: None,
        log_tail: None,
        tap_device: None,
    };
    state.store.insert(record.clone());
    if let Err(err) = state.layout.write_job_record(&record) {
        warn!(%job_id, error = %err, "cannot persist queued record");
    }
    info!(
        %job_id,
        task_id = task_id.as_deref().unwrap_or(""),
        invariants = record.task_spec.invariants.len(),
        archive = %archive_path.display(),
        "job queued"
    );

    let params = JobParams {
        timeout,
        net_checks: request.net_checks,
        quiet_kernel: request.quiet_kernel,
    };
    let done = match state.pool.submit(job_id, params) {
        Ok(done) => done,
        Err(SubmitError::QueueFull) => {
            state.store.remove(job_id);
            let _ = std::fs::remove_dir_all(&workspace_dir);
            return Err(ApiError::Busy);
        }
        Err(SubmitError::ShuttingDown) => {
            state.store.remove(job_id);
            let _ = std::fs::remove_dir_all(&workspace_dir);
            return Err(ApiError::NotReady("worker pool is shutting down".to_string()));
        }
    };

    // Blocking-with-queueing: suspend until the worker publishes a
    // terminal record. Client disconnects do not cancel the job.
    if done.await.is_err() {
        return Err(ApiError::Internal(
            "worker dropped the job completion signal".to_string(),
        ));
    }

    let record = state
        .store
        .get(job_id)
        .ok_or(ApiError::Internal("job record vanished".to_string()))?;
    info!(
        %job_id,
        status = ?record.status,
        dur_ms = started.elapsed().as_millis(),
        "job completed"
    );

    let body = SubmitResponse {
        job_id: job_id.to_string(),
        task_id: record.task_id.clone(),
        result: record.result.clone(),
        log_url: format!("/validate/{job_id}/log"),
        log_path: record.log_path.display().to_string(),
        submission_path: record.submission_path.display().to_string(),
        tap_device: record.tap_device.clone(),
    };
    let mut response = Json(body).into_response();
    if let Ok(header) = HeaderValue::from_str(&job_id.to_string()) {
        response.headers_mut().insert("X-Acore-Job-Id", header);
    }
    if let Ok(header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Acore-Request-Id", header);
    }
    Ok(response)
}

async fn active(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let active: Vec<ActiveJob> = state
        .store
        .active()
        .into_iter()
        .map(|r| ActiveJob {
            job_id: r.job_id.to_string(),
            status: r.status,
            log_url: format!("/validate/{}/log", r.job_id),
        })
        .collect();
    Json(serde_json::json!({"active": active}))
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job_id: String,
    task_id: Option<String>,
    status: JobStatus,
    enqueued_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    finished_at: Option<chrono::DateTime<Utc>>,
    result: Option<Verdict>,
    error: Option<String>,
    log_path: String,
    log_tail: Option<String>,
    tap_device: Option<String>,
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = JobId::parse(&job_id).ok_or(ApiError::NotFound("job"))?;
    let record = state.store.get(job_id).ok_or(ApiError::NotFound("job"))?;

    // Fall back to the live file tail for jobs still running.
    let log_tail = record.log_tail.clone().or_else(|| {
        let tail = persist::tail_log(&record.log_path, state.config.record_tail_lines);
        (!tail.is_empty()).then_some(tail)
    });

    Ok(Json(JobStatusResponse {
        job_id: record.job_id.to_string(),
        task_id: record.task_id,
        status: record.status,
        enqueued_at: record.enqueued_at,
        started_at: record.started_at,
        finished_at: record.finished_at,
        result: record.result,
        error: record.error,
        log_path: record.log_path.display().to_string(),
        log_tail,
        tap_device: record.tap_device,
    }))
}

async fn job_log(
    State(state): State<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let job_id = JobId::parse(&job_id).ok_or(ApiError::NotFound("job"))?;
    let record = state.store.get(job_id).ok_or(ApiError::NotFound("job"))?;
    if !record.log_path.exists() {
        return Err(ApiError::NotFound("job log"));
    }

    let lines = query
        .tail
        .unwrap_or(state.config.record_tail_lines)
        .clamp(1, state.config.log_tail_max_lines);
    let content = persist::tail_log(&record.log_path, lines);
    Ok(([("content-type", "text/plain; charset=utf-8")], content).into_response())
}

#[derive(Debug, Serialize)]
struct TaskJob {
    job_id: String,
    status: JobStatus,
    enqueued_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    finished_at: Option<chrono::DateTime<Utc>>,
    log_url: String,
    log_path: String,
    submission_path: String,
}

async fn task_records(
    State(state): State<Arc<AppState>>,
    UrlPath(task_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let jobs: Vec<TaskJob> = state
        .store
        .by_task(&task_id)
        .into_iter()
        .map(|r| TaskJob {
            job_id: r.job_id.to_string(),
            status: r.status,
            enqueued_at: r.enqueued_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            log_url: format!("/validate/{}/log", r.job_id),
            log_path: r.log_path.display().to_string(),
            submission_path: r.submission_path.display().to_string(),
        })
        .collect();

    let index_dir = state.layout.submission_dir(Some(&task_id));
    if jobs.is_empty() && !index_dir.exists() {
        return Err(ApiError::NotFound("task"));
    }
    Ok(Json(serde_json::json!({
        "task_id": task_id,
        "jobs": jobs,
        "submission_index_dir": index_dir.exists().then(|| index_dir.display().to_string()),
    })))
}
