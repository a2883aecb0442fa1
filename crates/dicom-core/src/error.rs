//! Error types for extended query tag reindexing.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tag, error-ledger, instance and reindex operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error). Always retryable.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Extended query tag not found (by path or key)
    #[error("Extended query tag not found: {0}")]
    ExtendedQueryTagNotFound(String),

    /// Reindex operation not found
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Duplicate tag path or duplicate error row
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Tag is bound to an active reindex operation
    #[error("Busy: {0}")]
    Busy(String),

    /// Concurrent binding or non-monotonic progress
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Adding the requested tags would exceed the configured cap
    #[error("Limit exceeded: at most {max} extended query tags are allowed")]
    LimitExceeded { max: usize },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (including unsupported schema versions)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is a transient storage fault that may succeed on retry.
    ///
    /// Pool exhaustion, dropped connections and I/O hiccups qualify; constraint
    /// violations and every domain variant do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::TypeNotFound { .. }
                    | sqlx::Error::Decode(_)
            ) && !is_constraint_violation(e),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

fn is_constraint_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| {
            matches!(
                db.kind(),
                sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation
            )
        })
        .unwrap_or(false)
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
