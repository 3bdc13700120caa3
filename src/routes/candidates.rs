use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::candidate::PreviewRequest;
use crate::routes::error::ApiResult;
use crate::services::submission::PreviewSummary;

/// POST /api/v1/candidates/preview: Duplicate and do-not-mail breakdown of
/// the ids a job would ingest.
pub async fn preview_candidates(
    State(state): State<AppState>,
    Json(req): Json<PreviewRequest>,
) -> ApiResult<Json<PreviewSummary>> {
    Ok(Json(state.submissions.preview(req).await?))
}
