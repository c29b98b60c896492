//! Types for the status and result service.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::StorageError;
use crate::job::{Artifact, FanoutTally, Job, JobKind, JobStatus, JobStoreError, Resolution};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("video not found: {0}")]
    VideoNotFound(String),

    /// The job has not reached a terminal state yet.
    #[error("job {job_id} is not finished (status: {status})")]
    NotReady { job_id: String, status: JobStatus },

    #[error("job {job_id} has no matching output (resolution: {resolution:?})")]
    ArtifactNotFound {
        job_id: String,
        resolution: Option<Resolution>,
    },

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("artifact storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A job's current state as seen by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub kind: JobKind,
    pub video_id: String,
    pub status: JobStatus,
    /// Index of the step running now, or the last one reached.
    pub current_step: usize,
    pub step_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fanout: Option<FanoutTally>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            video_id: job.video_id,
            status: job.status,
            current_step: job.current_step,
            step_count: job.step_count,
            error_detail: job.error_detail,
            fanout: job.fanout,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// A retrievable output of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRef {
    pub job_id: String,
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    pub storage_ref: String,
    /// Location of the file in the artifact store.
    pub path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl ResultRef {
    pub(crate) fn new(artifact: Artifact, path: PathBuf) -> Self {
        Self {
            job_id: artifact.job_id,
            artifact_id: artifact.id,
            resolution: artifact.resolution,
            storage_ref: artifact.storage_ref,
            path,
            checksum: artifact.checksum,
            size_bytes: artifact.size_bytes,
            created_at: artifact.created_at,
        }
    }
}

/// Aggregate numbers for one source video.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoStats {
    pub video_id: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub total_jobs: usize,
    /// Job count per status.
    pub jobs_by_status: BTreeMap<String, usize>,
    /// Number of jobs that include each stage kind.
    pub jobs_by_stage: BTreeMap<String, usize>,
    /// Tiers produced by any job for this video.
    pub resolutions: BTreeSet<Resolution>,
}
