//! Error types for segloop-server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Missing or rejected credentials (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Resource not found (404), message names the path or id
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict (409) - e.g., job id already taken
    #[error("Conflict: {0}")]
    Conflict(String),

    /// External tool or remote API failed, carries its raw error text
    #[error("{0}")]
    Dependency(String),

    /// External call exceeded its deadline (504)
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server-side configuration problem
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<segloop_common::Error> for ApiError {
    fn from(err: segloop_common::Error) -> Self {
        use segloop_common::Error as E;
        match err {
            E::InvalidInput(msg) => ApiError::BadRequest(msg),
            E::Unauthorized(msg) => ApiError::Unauthorized(msg),
            E::NotFound(msg) => ApiError::NotFound(msg),
            E::Conflict(msg) => ApiError::Conflict(msg),
            e @ E::External { .. } => ApiError::Dependency(e.to_string()),
            E::Timeout(msg) => ApiError::Timeout(msg),
            E::Config(msg) => ApiError::Config(msg),
            E::Internal(msg) => ApiError::Internal(msg),
            E::Io(e) => ApiError::Io(e),
            E::Database(e) => ApiError::Database(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Dependency(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DEPENDENCY_ERROR",
                msg,
            ),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg),
            ApiError::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                msg,
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg,
            ),
            ApiError::Io(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                err.to_string(),
            ),
            ApiError::Database(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                err.to_string(),
            ),
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(code = error_code, %message, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_errors_map_to_status() {
        let cases = [
            (segloop_common::Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (segloop_common::Error::NotFound("/a/b".into()), StatusCode::NOT_FOUND),
            (segloop_common::Error::Conflict("job".into()), StatusCode::CONFLICT),
            (segloop_common::Error::Unauthorized("bad".into()), StatusCode::UNAUTHORIZED),
            (segloop_common::Error::Timeout("export".into()), StatusCode::GATEWAY_TIMEOUT),
            (
                segloop_common::Error::external("nnUNetv2_predict", "boom"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_dependency_message_keeps_raw_text() {
        let err = ApiError::from(segloop_common::Error::external("CVAT", "HTTP 500: db down"));
        assert_eq!(err.to_string(), "CVAT failed: HTTP 500: db down");
    }
}
