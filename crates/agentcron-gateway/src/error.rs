//! HTTP error mapping.
//!
//! Every failure is rendered as `{"code": "...", "message": "..."}`; clients
//! match on `code`, never on the message text.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use agentcron_cron::CronError;

pub mod error_code {
    pub const INVALID_SCHEDULE: &str = "INVALID_SCHEDULE";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const ALREADY_RUNNING: &str = "ALREADY_RUNNING";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Cron(#[from] CronError),

    /// Malformed request body.
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,
}

impl ApiError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Cron(err) => match err {
                CronError::InvalidSchedule(_) => error_code::INVALID_SCHEDULE,
                CronError::Validation(_) => error_code::VALIDATION_FAILED,
                CronError::AlreadyRunning { .. } => error_code::ALREADY_RUNNING,
                CronError::TaskNotFound(_) | CronError::ExecutionNotFound(_) => {
                    error_code::NOT_FOUND
                }
                CronError::Storage(_) => error_code::STORAGE_ERROR,
                CronError::ExecutionFailed { .. } | CronError::CancellationTimeout { .. } => {
                    error_code::INTERNAL
                }
            },
            ApiError::BadRequest(_) => error_code::VALIDATION_FAILED,
            ApiError::Unauthorized => error_code::UNAUTHENTICATED,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Cron(err) => match err {
                CronError::InvalidSchedule(_) | CronError::Validation(_) => StatusCode::BAD_REQUEST,
                CronError::AlreadyRunning { .. } => StatusCode::CONFLICT,
                CronError::TaskNotFound(_) | CronError::ExecutionNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                CronError::Storage(_)
                | CronError::ExecutionFailed { .. }
                | CronError::CancellationTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({
            "code": self.error_code(),
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
