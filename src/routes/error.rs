use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::IngestError;
use crate::models::job::InvalidTransition;
use crate::services::export::ExportError;
use crate::services::store::StoreError;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Store(StoreError),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Store(err) => {
                tracing::error!(error = %err, "Store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => ApiError::NotFound(format!("Job {id} not found")),
            StoreError::InvalidTransition(e) => e.into(),
            other => ApiError::Store(other),
        }
    }
}

impl From<InvalidTransition> for ApiError {
    fn from(err: InvalidTransition) -> Self {
        ApiError::Conflict(err.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(msg) => ApiError::BadRequest(msg),
            IngestError::Persistence(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ExportError::NotCompleted { .. } => ApiError::Conflict(err.to_string()),
            ExportError::Store(e) => e.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (ApiError::from(IngestError::Validation("bad".into())), StatusCode::BAD_REQUEST),
            (ApiError::from(StoreError::JobNotFound(id)), StatusCode::NOT_FOUND),
            (
                ApiError::from(StoreError::InvalidTransition(InvalidTransition {
                    job_id: id,
                    from: JobStatus::Completed,
                    to: JobStatus::Cancelled,
                })),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(ExportError::NotCompleted {
                    job_id: id,
                    status: JobStatus::Processing,
                }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(StoreError::Unavailable("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
