use axum::http::{HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the job engine itself (queue, registry, worker).
///
/// Handler failures are carried as strings so they can be cloned into
/// `JOB_FAILED` events and log lines.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("Job manager is closed")]
    Closed,
    #[error("Job queue is full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("No handler registered for job type: {0}")]
    UnknownJobType(String),
    #[error("Handler error: {0}")]
    Handler(String),
    #[error("Handler panicked: {0}")]
    Panicked(String),
    #[error("Handler timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Permanent failures skip the retry policy entirely.
    pub fn is_permanent(&self) -> bool {
        matches!(self, QueueError::UnknownJobType(_) | QueueError::Config(_))
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found")]
    NotFound,
    #[error("Queue error: {0}")]
    Queue(QueueError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Queue(QueueError::UnknownJobType(job_type)) => (
                StatusCode::NOT_FOUND,
                format!("Unknown job type: {}", job_type),
            )
                .into_response(),
            AppError::Queue(e @ QueueError::Full { .. }) => {
                let mut headers = HeaderMap::new();
                headers.insert("Retry-After", HeaderValue::from_static("60"));
                (StatusCode::SERVICE_UNAVAILABLE, headers, e.to_string()).into_response()
            }
            AppError::Queue(e @ QueueError::Closed) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
            }
            AppError::Queue(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

impl From<QueueError> for AppError {
    fn from(value: QueueError) -> Self {
        AppError::Queue(value)
    }
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        AppError::Validation(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_job_type_is_permanent() {
        assert!(QueueError::UnknownJobType("nope".to_string()).is_permanent());
        assert!(!QueueError::Handler("boom".to_string()).is_permanent());
        assert!(!QueueError::Panicked("boom".to_string()).is_permanent());
        assert!(!QueueError::TimedOut(Duration::from_secs(1)).is_permanent());
    }

    #[test]
    fn test_queue_errors_map_to_status_codes() {
        let full = AppError::from(QueueError::Full { capacity: 10 }).into_response();
        assert_eq!(full.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(full.headers().contains_key("Retry-After"));

        let unknown = AppError::from(QueueError::UnknownJobType("x".into())).into_response();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let invalid = AppError::from("bad priority".to_string()).into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
