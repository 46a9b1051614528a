//! Error types for cgm-store.

use std::path::PathBuf;

/// Result type for cgm-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cgm-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// A stored value could not be interpreted.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for cgm_core::Error {
    fn from(error: Error) -> Self {
        cgm_core::Error::Persistence(error.to_string())
    }
}
