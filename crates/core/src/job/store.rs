//! Job storage trait and errors.

use thiserror::Error;

use super::types::{
    Artifact, CreateJobRequest, FanoutTally, Job, JobFilter, JobStatus, NewArtifact, NewVideo,
    StatusTransition, VariantOutcome, Video,
};

/// Error type for job store operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobStoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Database error: {0}")]
    Database(String),
}

/// Durable record of videos, jobs, their transitions and artifacts.
///
/// Implementations must make every mutating call atomic with respect to
/// concurrent callers. `compare_and_set_status` is the only way to change a
/// job's status.
pub trait JobStore: Send + Sync {
    /// Record an uploaded video.
    fn insert_video(&self, video: NewVideo) -> Result<Video, JobStoreError>;

    fn get_video(&self, id: &str) -> Result<Option<Video>, JobStoreError>;

    fn list_videos(&self) -> Result<Vec<Video>, JobStoreError>;

    /// Create a job in `queued` and record its initial transition.
    fn create_job(&self, request: CreateJobRequest) -> Result<Job, JobStoreError>;

    fn get_job(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    /// List jobs matching the filter, oldest first.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobStoreError>;

    /// Atomically move a job from `expected` to `next`.
    ///
    /// Returns `Ok(false)` when the job is not currently in `expected`, and
    /// `InvalidTransition` when `expected -> next` is not an edge of the state
    /// graph. `detail` is stored as the job's error detail when given.
    fn compare_and_set_status(
        &self,
        id: &str,
        expected: JobStatus,
        next: JobStatus,
        detail: Option<&str>,
    ) -> Result<bool, JobStoreError>;

    /// Recorded status transitions of a job, in order.
    fn transitions(&self, id: &str) -> Result<Vec<StatusTransition>, JobStoreError>;

    /// Flag a job for cooperative cancellation.
    fn request_cancel(&self, id: &str) -> Result<Job, JobStoreError>;

    /// Move a running job's step pointer from `from` to `to`.
    /// Returns `Ok(false)` if the pointer was not at `from`.
    fn advance_step(&self, id: &str, from: usize, to: usize) -> Result<bool, JobStoreError>;

    /// Start tracking `expected` resolution variants for a job.
    fn begin_fanout(&self, id: &str, expected: u32) -> Result<FanoutTally, JobStoreError>;

    /// Count one finished variant and return the updated tally.
    fn record_variant_outcome(
        &self,
        id: &str,
        outcome: VariantOutcome,
    ) -> Result<FanoutTally, JobStoreError>;

    fn add_artifact(&self, artifact: NewArtifact) -> Result<Artifact, JobStoreError>;

    /// Artifacts of a job, in creation order.
    fn artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, JobStoreError>;

    /// Drop the records of a job's intermediate artifacts once their files are released.
    fn remove_intermediate_artifacts(&self, job_id: &str) -> Result<usize, JobStoreError>;
}
