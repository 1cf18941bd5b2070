//! API error types and HTTP status mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::execution::ExecutorError;
use crate::scheduler::SchedulerError;
use crate::storage::StorageError;

/// API error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// The request is malformed or names an unsupported transition.
    BadRequest(String),
    /// Resource not found.
    NotFound(String),
    /// Request conflict.
    Conflict(String),
    /// Service unavailable (e.g., no remote executor, scheduler stopped).
    ServiceUnavailable(String),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::RunNotFound(_) | SchedulerError::TaskNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            SchedulerError::Config(e) => e.into(),
            SchedulerError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            SchedulerError::Transition(e) => ApiError::Conflict(e.to_string()),
            SchedulerError::Storage(e) => e.into(),
            SchedulerError::ChannelError(msg) => ApiError::ServiceUnavailable(msg),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => ApiError::NotFound(msg),
            StorageError::DuplicateKey(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::UnknownWorker(_)
            | ExecutorError::WorkerExpired(_)
            | ExecutorError::UnknownOrder(_) => ApiError::NotFound(err.to_string()),
            ExecutorError::InvalidClaim(msg) => ApiError::BadRequest(msg),
            ExecutorError::LockPoisoned => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RunId, TaskName, WorkerId};
    use http_body_util::BodyExt;

    async fn body_of(err: ApiError) -> (StatusCode, ErrorResponse) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let err: ApiError = SchedulerError::RunNotFound(RunId::new()).into();
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "NOT_FOUND");
        assert!(body.error.starts_with("run not found"));
    }

    #[tokio::test]
    async fn test_config_error_is_bad_request() {
        let err: ApiError = SchedulerError::Config(ConfigError::invalid("no tasks")).into();
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_unknown_worker_is_not_found() {
        let err: ApiError = ExecutorError::UnknownWorker(WorkerId::new()).into();
        let (status, _) = body_of(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_not_found_is_not_found() {
        let err: ApiError = SchedulerError::TaskNotFound {
            run_id: RunId::new(),
            task: TaskName::new("x"),
        }
        .into();
        let (status, _) = body_of(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_channel_error_is_unavailable() {
        let err: ApiError = SchedulerError::ChannelError("closed".into()).into();
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.error, "closed");
    }
}
