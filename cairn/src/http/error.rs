use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cairn_core::CommitmentError;
use cairn_store::StoreError;
use thiserror::Error;
use tracing::error;

/// Request-level error, mapped onto a status code and a JSON
/// `{"error": "<message>"}` body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Re-upload of an already-committed root. Reported with status 400;
    /// the distinction from `BadRequest` only matters for logging.
    #[error("{0}")]
    Conflict(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Conflict(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Internal(err) => {
                error!("internal error serving request: {err:?}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = serde_json::json!({ "error": message });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnsafePath(path) => ApiError::BadRequest(format!("unsafe path {path:?}")),
            StoreError::FileNotFound(path) => ApiError::NotFound(format!("no such file {path:?}")),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<CommitmentError> for ApiError {
    fn from(err: CommitmentError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}
