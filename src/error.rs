use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Missing identity headers")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Malformed(String),

    #[error("{0}")]
    NotFound(String),

    /// School settings the request depends on are unusable.
    #[error("{0}")]
    Misconfigured(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "ACCESS_DENIED"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "ACCESS_DENIED"),
            AppError::Malformed(_) => (StatusCode::BAD_REQUEST, "MALFORMED"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Misconfigured(_) => (StatusCode::UNPROCESSABLE_ENTITY, "MISCONFIGURED"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "UNEXPECTED"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, label) = self.status();
        let reason = match &self {
            AppError::Internal(e) => {
                error!("Request failed: {e:#}");
                "Unexpected error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "status": label, "reason": reason }))).into_response()
    }
}
