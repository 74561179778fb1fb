//! Common error types for segloop

use thiserror::Error;

/// Common result type for segloop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the segloop crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error, including unresolvable
    /// dataset label lookups
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found (message carries the exact path or id)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input, request parameter or data document
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Identifier already in use
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Credentials rejected by the annotation platform
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// External collaborator (CLI tool, remote API) reported a failure.
    /// `message` is the dependency's raw error text.
    #[error("{service} failed: {message}")]
    External { service: String, message: String },

    /// Operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an external-dependency failure
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Error::External {
            service: service.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(format!("JSON: {}", err))
    }
}
