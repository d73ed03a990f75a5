//! Error types for durable storage.

use thiserror::Error;

/// Storage error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The stored collection cannot be decoded and will not be overwritten.
    #[error("stored collection under {key} is corrupt: {reason}")]
    Corrupt {
        /// Namespace key of the collection.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

/// Convenience result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
