//! Error types for rlm-memory.

use thiserror::Error;

/// Result type alias using rlm-memory's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory and pruning operations.
///
/// Lookups and tier transitions that simply miss (unknown id, backwards
/// promotion) are reported through `bool`/`Option` returns, not through this
/// type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Two embeddings of different length met in one store or one prune call
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Embedding generation failed or no embedder is configured
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Imported snapshot is malformed
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Snapshot storage error
    #[error("Memory storage error: {0}")]
    MemoryStorage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create an invalid snapshot error.
    pub fn invalid_snapshot(message: impl Into<String>) -> Self {
        Self::InvalidSnapshot(message.into())
    }

    /// Check if this error is a dimension mismatch.
    pub fn is_dimension_mismatch(&self) -> bool {
        matches!(self, Self::DimensionMismatch { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::MemoryStorage(err.to_string())
    }
}
