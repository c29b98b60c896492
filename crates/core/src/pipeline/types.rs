//! Types for the pipeline executor.

use thiserror::Error;

use crate::artifact::StorageError;
use crate::engine::EngineError;
use crate::job::{JobStatus, JobStoreError, Resolution, ValidationError};

/// Errors surfaced by the pipeline executor.
///
/// Every error that reaches a caller has already been folded into the job's
/// terminal state; the job's `error_detail` carries the same text.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("video not found: {0}")]
    VideoNotFound(String),

    /// The job's input could not be resolved.
    #[error("missing input: {0}")]
    MissingInput(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("stage {stage_index} ({operation}): {source}")]
    Engine {
        stage_index: usize,
        operation: String,
        #[source]
        source: EngineError,
    },

    #[error("artifact storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("job {job_id} has no step {step}")]
    UnknownStep { job_id: String, step: usize },

    /// Another executor moved the job while this one held it.
    #[error("lost ownership of job {job_id} at step {step}")]
    LostOwnership { job_id: String, step: usize },

    #[error("job {0} was canceled")]
    Canceled(String),

    /// The job finished in `failed`, e.g. after a fan-out variant failed.
    #[error("job {job_id} failed: {detail}")]
    JobFailed { job_id: String, detail: String },

    /// The job is not in a state the executor can run.
    #[error("job {job_id} is {status}")]
    NotRunnable { job_id: String, status: JobStatus },
}

impl PipelineError {
    pub fn engine(stage_index: usize, operation: impl Into<String>, source: EngineError) -> Self {
        Self::Engine {
            stage_index,
            operation: operation.into(),
            source,
        }
    }

    /// Whether the error came from a stage validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// What a processed step asks of its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Run step `n` next.
    Next(usize),
    /// Run one variant per resolution of step `step`.
    FanOut {
        step: usize,
        resolutions: Vec<Resolution>,
    },
    /// The job reached a terminal state.
    Finished(JobStatus),
    /// The unit no longer applies (job canceled, already advanced or finished).
    Stale,
}
