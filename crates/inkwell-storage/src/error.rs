//! Error types for inkwell-storage
//!
//! Every fallible operation in the crate returns [`StorageResult`]. I/O errors
//! are classified on conversion so the save path can tell a read-only file
//! apart from a transient failure.

use std::io::ErrorKind;

use thiserror::Error;

/// Everything that can go wrong while buffering, logging or saving notes
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO failure: {0}")]
    Io(String),

    /// The target is read-only or access was denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A file or directory was not found
    #[error("No such file: {0}")]
    NotFound(String),

    /// The document is not open in the engine
    #[error("Document not open: {0}")]
    DocumentNotFound(String),

    /// A log record could not be encoded
    #[error("Cannot encode log record: {0}")]
    Serialization(String),

    /// A log record could not be decoded
    #[error("Cannot decode log record: {0}")]
    Deserialization(String),

    /// Invalid or unreadable configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The filesystem watcher failed
    #[error("Watch error: {0}")]
    Watch(String),

    /// A background worker has already shut down
    #[error("Closed: {0}")]
    Closed(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
            ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            _ => StorageError::Io(err.to_string()),
        }
    }
}

impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Deserialization(err.to_string())
    }
}

impl From<notify::Error> for StorageError {
    fn from(err: notify::Error) -> Self {
        StorageError::Watch(err.to_string())
    }
}

impl StorageError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    pub fn document_not_found(id: impl Into<String>) -> Self {
        Self::DocumentNotFound(id.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed(what.into())
    }

    /// Whether retrying without outside intervention is pointless
    pub fn is_permanent(&self) -> bool {
        matches!(self, StorageError::PermissionDenied(_))
    }
}

/// Result alias used throughout the crate
pub type StorageResult<T> = Result<T, StorageError>;
