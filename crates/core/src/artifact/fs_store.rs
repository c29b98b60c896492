//! Filesystem-backed artifact store.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use super::checksum::sha256_file;
use super::error::StorageError;
use super::traits::{ArtifactStore, PutMode, StoredObject};

const BUFFER_SIZE: usize = 256 * 1024;

/// Stores objects as files under a root directory. References are
/// root-relative paths using `/` separators.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_key(key: &str) -> Result<(), StorageError> {
        let path = Path::new(key);
        let valid = !key.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if valid {
            Ok(())
        } else {
            Err(StorageError::InvalidReference {
                reference: key.to_string(),
            })
        }
    }

    /// Attempts to move a file atomically (rename).
    async fn try_atomic_move(source: &Path, destination: &Path) -> Result<bool, std::io::Error> {
        match fs::rename(source, destination).await {
            Ok(()) => Ok(true),
            Err(e) => {
                // Cross-filesystem renames fail with EXDEV (18 on Linux)
                if e.kind() == std::io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(18) {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Copies a file while hashing it.
    async fn copy_file(source: &Path, destination: &Path) -> Result<(u64, String), StorageError> {
        let copy_err =
            |e| StorageError::copy_failed(source.to_path_buf(), destination.to_path_buf(), e);

        let source_file = File::open(source).await.map_err(copy_err)?;
        let dest_file = File::create(destination).await.map_err(copy_err)?;

        let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);
        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer).await.map_err(copy_err)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            writer
                .write_all(&buffer[..bytes_read])
                .await
                .map_err(copy_err)?;
            total_bytes += bytes_read as u64;
        }

        writer.flush().await.map_err(copy_err)?;

        Ok((total_bytes, format!("{:x}", hasher.finalize())))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn put(&self, source: &Path, key: &str, mode: PutMode) -> Result<StoredObject, StorageError> {
        if !fs::try_exists(source).await.unwrap_or(false) {
            return Err(StorageError::SourceNotFound {
                path: source.to_path_buf(),
            });
        }

        let destination = self.locate(key)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::DirectoryCreationFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        if mode == PutMode::Move && Self::try_atomic_move(source, &destination).await? {
            let size_bytes = fs::metadata(&destination).await?.len();
            let checksum = sha256_file(&destination).await?;
            debug!(key, size_bytes, "Moved artifact into store");
            return Ok(StoredObject {
                reference: key.to_string(),
                size_bytes,
                checksum,
            });
        }

        // Copy next to the destination first so readers never see a partial file.
        let partial = destination.with_extension("partial");
        let copied = Self::copy_file(source, &partial).await;
        let (size_bytes, checksum) = match copied {
            Ok(result) => result,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        fs::rename(&partial, &destination).await?;

        if mode == PutMode::Move {
            let _ = fs::remove_file(source).await;
        }

        debug!(key, size_bytes, "Copied artifact into store");
        Ok(StoredObject {
            reference: key.to_string(),
            size_bytes,
            checksum,
        })
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.locate(reference)?;
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    reference: reference.to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    fn locate(&self, reference: &str) -> Result<PathBuf, StorageError> {
        Self::validate_key(reference)?;
        Ok(self.root.join(reference))
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        let path = self.locate(reference)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
