//! Trait definitions for the artifact module.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::error::StorageError;

/// How a file is taken into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Leave the source in place.
    Copy,
    /// Consume the source, renaming when possible.
    Move,
}

/// An object held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub reference: String,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub checksum: String,
}

/// Path-addressed storage for source videos and final outputs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Returns the name of this store implementation.
    fn name(&self) -> &str;

    /// Stores the file at `source` under `key` and returns its reference.
    async fn put(&self, source: &Path, key: &str, mode: PutMode) -> Result<StoredObject, StorageError>;

    /// Reads the full contents of a stored object.
    async fn get(&self, reference: &str) -> Result<Vec<u8>, StorageError>;

    /// Local path of a stored object, for handing to the engine.
    fn locate(&self, reference: &str) -> Result<PathBuf, StorageError>;

    /// Removes a stored object. Missing objects are not an error.
    async fn delete(&self, reference: &str) -> Result<(), StorageError>;
}
