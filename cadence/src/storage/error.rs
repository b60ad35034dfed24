use crate::core::{BoxError, Error as CoreError};
use std::path::PathBuf;
use thiserror::Error;

/// Storage layer error type.
///
/// Wraps I/O and serialization failures from store backends while keeping
/// the error chain intact. Converts into [`crate::Error`] at the
/// orchestrator boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// An I/O operation failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// A record or snapshot could not be (de)serialized.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// Persisted data is inconsistent, e.g. a delta log without its base.
    #[error("corrupted store data at {}: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },

    /// The key cannot be used by this backend.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// The backend does not implement an optional operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Failure reported by a third-party backend.
    #[error("storage backend error")]
    Backend(#[source] BoxError),
}

impl StorageError {
    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn backend(error: impl Into<BoxError>) -> Self {
        Self::Backend(error.into())
    }
}

impl From<StorageError> for CoreError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidKey { .. } => CoreError::invalid_argument(error.to_string()),
            other => {
                let message = format!("storage failure: {}", other);
                CoreError::runtime_with(message, other)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
