//! Error types for cortex-memory.

use thiserror::Error;

/// Result type alias using cortex-memory's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The embedding provider could not produce a vector
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The database was busy or locked by another writer
    #[error("Memory storage busy: {0}")]
    StorageBusy(String),

    /// Memory storage error
    #[error("Memory storage error: {0}")]
    MemoryStorage(String),

    /// A referenced record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Another consolidation run holds the in-process guard
    #[error("Consolidation already in progress")]
    ConsolidationInProgress,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an embedding-unavailable error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Classify a SQLite error. Busy and locked databases are transient.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::StorageBusy(err.to_string())
            }
            _ => Self::MemoryStorage(err.to_string()),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageBusy(_))
    }
}
