//! Error types for the Falcata library.
//!
//! All fallible operations return [`Result`], an alias over [`FalcataError`].
//! The taxonomy follows the engine's failure model: configuration errors fail
//! fast before any I/O, corruption errors abort the owning merge plan and are
//! never silently patched, resource errors propagate to the caller.

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Falcata operations.
#[derive(Error, Debug)]
pub enum FalcataError {
    /// I/O errors (file operations, sync, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index-structure errors (segments, versions, reclaim maps)
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors (bad strategy parameter, unsupported topology)
    #[error("Configuration error: {0}")]
    Config(String),

    /// On-disk corruption (count mismatch, unknown magic, bad checksum)
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Serialization / binary layout errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with FalcataError.
pub type Result<T> = std::result::Result<T, FalcataError>;

impl FalcataError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        FalcataError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        FalcataError::Storage(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        FalcataError::Config(msg.into())
    }

    /// Create a new corruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        FalcataError::Corruption(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        FalcataError::Serialization(msg.into())
    }

    /// Create a new invalid-operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        FalcataError::InvalidOperation(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        FalcataError::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = FalcataError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = FalcataError::config("bad parameter");
        assert_eq!(error.to_string(), "Configuration error: bad parameter");

        let error = FalcataError::corruption("magic mismatch");
        assert_eq!(error.to_string(), "Corruption detected: magic mismatch");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let falcata_error = FalcataError::from(io_error);

        match falcata_error {
            FalcataError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }
}
