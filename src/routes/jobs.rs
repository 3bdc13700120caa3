use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{CreateJobRequest, JobLogEntry, JobView};
use crate::models::record::ExternalId;
use crate::routes::error::{ApiError, ApiResult};
use crate::services::export::ExportBatch;
use crate::services::progress::JobLog;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    #[serde(default)]
    pub remail_overrides: Vec<String>,
}

/// POST /api/v1/jobs: Submit a new ingestion job.
pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let job = state.submissions.submit(req).await?;
    Ok((StatusCode::CREATED, Json(JobView::from(&job))))
}

/// GET /api/v1/jobs: Most recent jobs first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<JobView>>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let jobs = state.jobs.list_jobs(limit).await?;
    Ok(Json(jobs.iter().map(JobView::from).collect()))
}

/// GET /api/v1/jobs/{job_id}: Poll job progress.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    let job = state
        .jobs
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {job_id} not found")))?;
    Ok(Json(JobView::from(&job)))
}

/// GET /api/v1/jobs/{job_id}/logs: Progress log in insertion order.
pub async fn get_job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Vec<JobLogEntry>>> {
    if state.jobs.get_job(job_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Job {job_id} not found")));
    }
    Ok(Json(state.jobs.job_logs(job_id).await?))
}

/// POST /api/v1/jobs/{job_id}/cancel: The worker stops at the next batch
/// boundary.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    let job = state.submissions.cancel(job_id).await?;
    Ok(Json(JobView::from(&job)))
}

/// GET /api/v1/jobs/stale: Processing jobs past the stale timeout.
pub async fn list_stale_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<JobView>>> {
    let jobs = state.jobs.list_stale(state.stale_timeout).await?;
    Ok(Json(jobs.iter().map(JobView::from).collect()))
}

/// POST /api/v1/jobs/{job_id}/reset: Return a stale job to the queue.
pub async fn reset_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    if !state.jobs.mark_stale(job_id, state.stale_timeout).await? {
        return Err(match state.jobs.get_job(job_id).await? {
            None => ApiError::NotFound(format!("Job {job_id} not found")),
            Some(job) => ApiError::Conflict(format!(
                "Job {job_id} is {} and not stale",
                job.status
            )),
        });
    }

    JobLog::new(state.jobs.clone(), job_id)
        .warning("Reset to pending by operator after stale timeout")
        .await;
    let job = state
        .jobs
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {job_id} not found")))?;
    Ok(Json(JobView::from(&job)))
}

/// POST /api/v1/jobs/{job_id}/export: Records of a completed job, with
/// do-not-mail subjects withheld unless overridden.
pub async fn export_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    body: Option<Json<ExportRequest>>,
) -> ApiResult<Json<ExportBatch>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let overrides: Vec<ExternalId> = req
        .remail_overrides
        .iter()
        .map(ExternalId::new)
        .filter(|id| !id.is_empty())
        .collect();

    Ok(Json(state.exporter.export(job_id, &overrides).await?))
}
