//! Progress and metrics API.

use crate::app::App;
use crate::db::{LanguageStats, SyncJob};
use crate::orchestrator::MetricsReport;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

type ApiResult<T> = Result<T, (StatusCode, Json<serde_json::Value>)>;

fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({ "error": true, "message": message.into() })),
    )
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    error!("Request failed: {:#}", e);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub total: usize,
    pub processed: usize,
    pub percentage: f64,
    pub status: String,
    pub failure_reason: Option<String>,
    pub target_langs: Vec<String>,
}

impl From<&SyncJob> for JobProgress {
    fn from(job: &SyncJob) -> Self {
        Self {
            job_id: job.id.clone(),
            total: job.total,
            processed: job.processed,
            percentage: job.percentage(),
            status: job.status.as_str().to_string(),
            failure_reason: job.failure_reason.clone(),
            target_langs: job.target_langs.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub target_langs: Vec<String>,
    pub scope: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub translation: MetricsReport,
    pub languages: Vec<LanguageStats>,
    pub scope_mappings: usize,
    pub pending_tasks: usize,
}

pub fn router(app: App) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(app: App, port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Status API listening on port {}", port);

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Status API stopped");
    Ok(())
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn list_jobs(
    State(app): State<App>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<JobProgress>>> {
    let limit = params.limit.unwrap_or(20).min(200);
    let jobs = app.db.list_jobs(limit).map_err(internal_error)?;
    Ok(Json(jobs.iter().map(JobProgress::from).collect()))
}

pub async fn get_job(State(app): State<App>, Path(id): Path<String>) -> ApiResult<Json<JobProgress>> {
    match app.db.get_job(&id).map_err(internal_error)? {
        Some(job) => Ok(Json(JobProgress::from(&job))),
        None => Err(api_error(StatusCode::NOT_FOUND, format!("job {} not found", id))),
    }
}

pub async fn create_job(
    State(app): State<App>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<JobProgress>)> {
    let Some(expected) = app.config.api_key.as_deref() else {
        warn!("Rejected job request: API_KEY is not configured");
        return Err(api_error(StatusCode::FORBIDDEN, "job submission is disabled; set API_KEY"));
    };
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_compare(provided, expected) {
        warn!("Rejected job request with invalid API key");
        return Err(api_error(StatusCode::UNAUTHORIZED, "invalid API key"));
    }

    let job = app
        .orchestrator
        .enqueue_translation(&request.target_langs, request.scope, request.limit)
        .map_err(internal_error)?;

    Ok((StatusCode::ACCEPTED, Json(JobProgress::from(&job))))
}

pub async fn metrics(State(app): State<App>) -> ApiResult<Json<MetricsResponse>> {
    let languages = app.db.translation_stats().map_err(internal_error)?;
    let scope_mappings = app.db.mapping_count().map_err(internal_error)?;
    let pending_tasks = app.db.pending_task_count().map_err(internal_error)?;

    Ok(Json(MetricsResponse {
        translation: app.metrics.report(),
        languages,
        scope_mappings,
        pending_tasks,
    }))
}
