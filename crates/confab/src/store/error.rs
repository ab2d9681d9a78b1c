//! Unified error types for storage operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    // ========================================================================
    // File-based backend errors
    // ========================================================================
    /// I/O error during file operations.
    #[error("I/O error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error deserializing file contents.
    #[error("deserialization error at {path}: {message}")]
    FileDeserialization { path: PathBuf, message: String },

    // ========================================================================
    // Generic errors (any backend)
    // ========================================================================
    /// Error serializing data.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key that cannot be stored safely (e.g. contains a path separator).
    #[error("invalid {entity_type} key: {key:?}")]
    InvalidKey {
        entity_type: &'static str,
        key: String,
    },
}

impl StorageError {
    /// Create a file I/O error with path context.
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Create a file deserialization error with path context.
    pub fn file_deserialization(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileDeserialization {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create an invalid key error.
    pub fn invalid_key(entity_type: &'static str, key: impl Into<String>) -> Self {
        Self::InvalidKey {
            entity_type,
            key: key.into(),
        }
    }
}

/// Convenience type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
