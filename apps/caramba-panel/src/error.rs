use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use caramba_shared::error::ErrorCode;
use serde_json::json;

/// Wire-facing error taxonomy. Every RPC handler returns this instead
/// of a raw `anyhow::Error` once it needs to distinguish `not_found` from
/// `internal` at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl ControlError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ControlError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ControlError::NotFound(_) => ErrorCode::NotFound,
            ControlError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            ControlError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            ControlError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            ControlError::Internal(_) => ErrorCode::Internal,
            ControlError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ControlError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::AlreadyExists(_) => StatusCode::CONFLICT,
            ControlError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            ControlError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        if matches!(self, ControlError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let body = Json(json!({
            "error_code": self.error_code().as_str(),
            "message": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
