//! Types for the job orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::StorageError;
use crate::engine::EngineError;
use crate::job::{JobStatus, JobStoreError, Resolution, ValidationError};
use crate::queue::PoolStatus;

/// Reasons a submission is rejected. A rejected submission creates no job.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("video not found: {0}")]
    VideoNotFound(String),

    #[error("parent job not found: {0}")]
    ParentNotFound(String),

    #[error("parent job {job_id} has not succeeded (status: {status})")]
    ParentNotReady { job_id: String, status: JobStatus },

    #[error("parent job {job_id} has no output (resolution: {resolution:?})")]
    ParentOutputMissing {
        job_id: String,
        resolution: Option<Resolution>,
    },

    /// The queue is full; the caller should retry later.
    #[error("task queue is at capacity ({capacity}), retry later")]
    Backpressure { capacity: usize },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("could not inspect input: {0}")]
    Probe(#[from] EngineError),

    #[error("artifact storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

impl SubmitError {
    /// Label used for rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::VideoNotFound(_)
            | Self::ParentNotFound(_)
            | Self::ParentNotReady { .. }
            | Self::ParentOutputMissing { .. } => "input",
            Self::Backpressure { .. } => "backpressure",
            Self::ShuttingDown => "shutting_down",
            Self::Probe(_) | Self::Storage(_) => "probe",
            Self::Store(_) => "store",
        }
    }

    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Backpressure { .. })
    }
}

/// Errors from orchestrator operations other than submission.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} already finished (status: {status})")]
    AlreadyFinished { job_id: String, status: JobStatus },

    #[error("timed out waiting for job {job_id} (status: {status})")]
    Timeout { job_id: String, status: JobStatus },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("artifact storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Whether the worker pool is running.
    pub running: bool,
    pub pool: PoolStatus,
    /// Jobs waiting for their first step.
    pub queued_jobs: usize,
    /// Jobs currently being executed.
    pub running_jobs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reasons() {
        assert_eq!(
            SubmitError::Backpressure { capacity: 1 }.reason(),
            "backpressure"
        );
        assert!(SubmitError::Backpressure { capacity: 1 }.is_backpressure());
        assert_eq!(SubmitError::VideoNotFound("v".into()).reason(), "input");
        assert_eq!(SubmitError::ShuttingDown.reason(), "shutting_down");
    }

    #[test]
    fn test_status_serialization() {
        let status = OrchestratorStatus {
            running: true,
            queued_jobs: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["queued_jobs"], 2);
    }
}
