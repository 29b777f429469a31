use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt session file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        StorageError::Corrupt {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// True when the session simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::SessionNotFound(_))
    }
}
