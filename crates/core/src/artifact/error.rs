//! Error types for the artifact module.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while storing or reading artifacts.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object stored under the reference.
    #[error("Artifact not found: {reference}")]
    NotFound { reference: String },

    /// Reference is absolute or escapes the store root.
    #[error("Invalid storage reference: {reference}")]
    InvalidReference { reference: String },

    /// Source file for a put does not exist.
    #[error("Source file not found: {path}")]
    SourceNotFound { path: PathBuf },

    /// Failed to copy file into the store.
    #[error("Failed to copy file from {source} to {destination}")]
    CopyFailed {
        source: PathBuf,
        destination: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// Failed to create a directory.
    #[error("Failed to create directory: {path}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Creates a new copy failed error.
    pub fn copy_failed(source: PathBuf, destination: PathBuf, error: std::io::Error) -> Self {
        Self::CopyFailed {
            source,
            destination,
            error,
        }
    }
}
