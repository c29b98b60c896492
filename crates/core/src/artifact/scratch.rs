//! Per-job temporary storage for intermediate outputs.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::error::StorageError;
use crate::job::Resolution;

/// Scratch directories, one per job, under a shared root.
///
/// Jobs never share a directory, so concurrent jobs do not contend on
/// intermediate files. Everything under a job's directory is released when
/// the job reaches a terminal state.
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    root: PathBuf,
}

impl ScratchSpace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Creates the job's directory if needed.
    pub async fn ensure(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::DirectoryCreationFailed {
                path: dir.clone(),
                source: e,
            })?;
        Ok(dir)
    }

    /// Output path of step `step`.
    pub fn step_output(&self, job_id: &str, step: usize, extension: &str) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("stage-{}.{}", step, extension))
    }

    /// Output path of one resolution variant.
    pub fn variant_output(&self, job_id: &str, resolution: Resolution, extension: &str) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("variant-{}.{}", resolution, extension))
    }

    /// Removes a partial output left by a failed attempt.
    pub async fn discard(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Discarded partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to discard partial output"),
        }
    }

    /// Deletes the job's directory and everything in it.
    pub async fn release(&self, job_id: &str) -> Result<(), StorageError> {
        let dir = self.job_dir(job_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(job_id, "Released scratch space");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_dirs_are_isolated() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(root.path());

        let a = scratch.ensure("job-a").await.unwrap();
        let b = scratch.ensure("job-b").await.unwrap();
        assert_ne!(a, b);

        assert_eq!(
            scratch.step_output("job-a", 2, "mp4"),
            root.path().join("job-a").join("stage-2.mp4")
        );
        assert_eq!(
            scratch.variant_output("job-a", Resolution::R480p, "mp4"),
            root.path().join("job-a").join("variant-480p.mp4")
        );
    }

    #[tokio::test]
    async fn test_release_removes_only_that_job() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(root.path());
        scratch.ensure("job-a").await.unwrap();
        scratch.ensure("job-b").await.unwrap();
        tokio::fs::write(scratch.step_output("job-a", 0, "mp4"), b"x")
            .await
            .unwrap();

        scratch.release("job-a").await.unwrap();
        assert!(!scratch.job_dir("job-a").exists());
        assert!(scratch.job_dir("job-b").exists());

        // Releasing twice is fine.
        scratch.release("job-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_missing_file_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(root.path());
        scratch.discard(&root.path().join("missing.mp4")).await;
    }
}
