use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::dnm::{DnmCheck, DnmEntry, NewDnmEntry};
use crate::models::record::ExternalId;
use crate::routes::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub ids: Vec<String>,
}

/// POST /api/v1/dnm/check
pub async fn check(
    State(state): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> ApiResult<Json<Vec<DnmCheck>>> {
    if req.ids.len() > 10_000 {
        return Err(ApiError::BadRequest(
            "at most 10000 ids may be checked at once".to_string(),
        ));
    }
    let ids: Vec<ExternalId> = req.ids.iter().map(ExternalId::new).collect();
    Ok(Json(state.dnm.check_batch(&ids).await?))
}

/// POST /api/v1/dnm
pub async fn add_entry(
    State(state): State<AppState>,
    Json(entry): Json<NewDnmEntry>,
) -> ApiResult<(StatusCode, Json<DnmEntry>)> {
    let stored = state.dnm.add(entry).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// POST /api/v1/dnm/{entry_id}/deactivate: The entry stays in history.
pub async fn deactivate_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
) -> ApiResult<Json<DnmEntry>> {
    state
        .dnm
        .deactivate(entry_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("DNM entry {entry_id} not found")))
}
