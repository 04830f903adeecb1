//! Error types for contextlog-core

use thiserror::Error;

/// Main error type for the contextlog-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error for transcripts, tool logs or hook payloads
    #[error("parse error in {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Cycle not found
    #[error("cycle not found: {0}")]
    CycleNotFound(i64),
}

/// Result type alias for contextlog-core
pub type Result<T> = std::result::Result<T, Error>;
