//! Error types for khata-core

use thiserror::Error;

/// Result type alias using khata-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in khata-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input; not retryable
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Caller is not the record owner
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Retryable storage failure (e.g. a busy database)
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
