//! Error types for object store operations.

use std::fmt;

/// Result type for object store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur while talking to the object store.
#[derive(Debug)]
pub enum BlobError {
    /// Object not found at the given key.
    NotFound { key: String },

    /// Bad or missing configuration value.
    Config { reason: String },

    /// Provider/network error surfaced by the store.
    Store { source: object_store::Error },

    /// I/O error on the local side of a transfer.
    Io { source: std::io::Error },
}

impl BlobError {
    pub fn config(reason: impl Into<String>) -> Self {
        BlobError::Config {
            reason: reason.into(),
        }
    }

    /// True when the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::NotFound { key } => write!(f, "object not found: {}", key),
            BlobError::Config { reason } => write!(f, "invalid cloud configuration: {}", reason),
            BlobError::Store { source } => write!(f, "object store error: {}", source),
            BlobError::Io { source } => write!(f, "i/o error: {}", source),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::Store { source } => Some(source),
            BlobError::Io { source } => Some(source),
            _ => None,
        }
    }
}

impl From<object_store::Error> for BlobError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BlobError::NotFound { key: path },
            other => BlobError::Store { source: other },
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io { source: err }
    }
}
