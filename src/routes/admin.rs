use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::models::record::PurgeReport;
use crate::routes::error::ApiResult;
use crate::services::purge;

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub state: String,
    /// Without this only counts are returned.
    #[serde(default)]
    pub confirm: bool,
}

/// POST /api/v1/admin/purge-state
pub async fn purge_state(
    State(state): State<AppState>,
    Json(req): Json<PurgeRequest>,
) -> ApiResult<Json<PurgeReport>> {
    let report = purge::purge_state(state.records.as_ref(), &req.state, req.confirm).await?;
    Ok(Json(report))
}
