use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Admission denied by quota '{0}'")]
    Denied(String),

    #[error("Downstream call failed: {0}")]
    DownstreamFailure(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("File system error: {0}")]
    FileSystemError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl LimiterError {
    pub fn quota_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Quota", id: id.into() }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Task", id: id.into() }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            LimiterError::NotFound { .. } => StatusCode::NOT_FOUND,
            LimiterError::AlreadyExists { .. } => StatusCode::CONFLICT,
            LimiterError::InvalidConfig(_) | LimiterError::InvalidCron { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LimiterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            LimiterError::Denied(_) => StatusCode::TOO_MANY_REQUESTS,
            LimiterError::DownstreamFailure(_) => StatusCode::BAD_GATEWAY,
            LimiterError::JobFailed(_)
            | LimiterError::FileSystemError(_)
            | LimiterError::JsonError(_)
            | LimiterError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Result type alias for limiter operations
pub type Result<T> = std::result::Result<T, LimiterError>;
