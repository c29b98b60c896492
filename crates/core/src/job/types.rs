//! Core job data types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::{InputProfile, Resolution, StageKind, StageSpec};

// ============================================================================
// Videos
// ============================================================================

/// An uploaded source video. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    /// Artifact store reference of the source file.
    pub storage_ref: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Video {
    pub fn profile(&self) -> InputProfile {
        InputProfile::new(self.duration_secs, self.height)
    }
}

/// Request to record a new video.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub storage_ref: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

// ============================================================================
// Job status state machine
// ============================================================================

/// Lifecycle state of a job.
///
/// ```text
/// queued -> running -> succeeded
///    |         |----> failed
///    |         '----> canceled
///    '--------------> canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether `self -> next` is an edge of the state graph.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Canceled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Canceled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub job_id: String,
    /// `None` for the initial `queued` record.
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Jobs
// ============================================================================

/// Type of a job, derived from its stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Trim,
    Overlay,
    Watermark,
    Transcode,
    Pipeline,
}

impl JobKind {
    /// Single-kind stage lists get that kind, anything mixed is a pipeline.
    pub fn from_stages(stages: &[StageSpec]) -> Self {
        let mut kinds = stages.iter().map(StageSpec::kind);
        let Some(first) = kinds.next() else {
            return JobKind::Pipeline;
        };
        if kinds.any(|k| k != first) {
            return JobKind::Pipeline;
        }
        match first {
            StageKind::Trim => JobKind::Trim,
            StageKind::Overlay => JobKind::Overlay,
            StageKind::Watermark => JobKind::Watermark,
            StageKind::Transcode => JobKind::Transcode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Trim => "trim",
            JobKind::Overlay => "overlay",
            JobKind::Watermark => "watermark",
            JobKind::Transcode => "transcode",
            JobKind::Pipeline => "pipeline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trim" => Some(JobKind::Trim),
            "overlay" => Some(JobKind::Overlay),
            "watermark" => Some(JobKind::Watermark),
            "transcode" => Some(JobKind::Transcode),
            "pipeline" => Some(JobKind::Pipeline),
            _ => None,
        }
    }
}

/// What a job reads as its first input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum JobInput {
    /// An uploaded video.
    Video { video_id: String },
    /// A final artifact of a succeeded job. `None` picks the highest resolution.
    Job {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolution: Option<Resolution>,
    },
}

impl JobInput {
    pub fn video(video_id: impl Into<String>) -> Self {
        JobInput::Video {
            video_id: video_id.into(),
        }
    }

    pub fn job(job_id: impl Into<String>, resolution: Option<Resolution>) -> Self {
        JobInput::Job {
            job_id: job_id.into(),
            resolution,
        }
    }
}

/// Progress of a multi-resolution fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutTally {
    pub expected: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl FanoutTally {
    pub fn finished(&self) -> u32 {
        self.succeeded + self.failed + self.skipped
    }

    pub fn is_complete(&self) -> bool {
        self.expected > 0 && self.finished() >= self.expected
    }
}

/// Result of one resolution variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantOutcome {
    Succeeded,
    Failed,
    /// Not started because cancellation was requested.
    Skipped,
}

/// A requested transformation and its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub input: JobInput,
    /// Root source video, inherited through chained jobs.
    pub video_id: String,
    pub stages: Vec<StageSpec>,
    pub status: JobStatus,
    /// Index of the step being (or last) executed.
    pub current_step: usize,
    /// Number of executable steps in the plan.
    pub step_count: usize,
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout: Option<FanoutTally>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a new job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub input: JobInput,
    pub video_id: String,
    pub stages: Vec<StageSpec>,
    pub step_count: usize,
}

/// Filter for querying jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub video_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            video_id: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_video(mut self, video_id: impl Into<String>) -> Self {
        self.video_id = Some(video_id.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Output of a non-final step, living in the job's scratch space.
    Intermediate,
    /// Retained output of the last step.
    Final,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Intermediate => "intermediate",
            ArtifactKind::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "intermediate" => Some(ArtifactKind::Intermediate),
            "final" => Some(ArtifactKind::Final),
            _ => None,
        }
    }
}

/// An immutable output of one step or one resolution variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub job_id: String,
    pub kind: ArtifactKind,
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    pub storage_ref: String,
    /// Hex-encoded SHA-256 of the file contents.
    pub checksum: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Request to register an artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub job_id: String,
    pub kind: ArtifactKind,
    pub step_index: usize,
    pub resolution: Option<Resolution>,
    pub storage_ref: String,
    pub checksum: String,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::stage::{OverlaySpec, WatermarkSpec};

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_allowed_transitions() {
        use JobStatus::*;
        let all = [Queued, Running, Succeeded, Failed, Canceled];
        let allowed = [
            (Queued, Running),
            (Queued, Canceled),
            (Running, Succeeded),
            (Running, Failed),
            (Running, Canceled),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_job_kind_from_stages() {
        assert_eq!(
            JobKind::from_stages(&[StageSpec::trim(0.0, 1.0)]),
            JobKind::Trim
        );
        assert_eq!(
            JobKind::from_stages(&[
                StageSpec::Overlay(OverlaySpec::text("a", 0.0, None)),
                StageSpec::Overlay(OverlaySpec::text("b", 0.0, None)),
            ]),
            JobKind::Overlay
        );
        assert_eq!(
            JobKind::from_stages(&[
                StageSpec::Overlay(OverlaySpec::text("a", 0.0, None)),
                StageSpec::Watermark(WatermarkSpec::new("/wm.png")),
            ]),
            JobKind::Pipeline
        );
    }

    #[test]
    fn test_fanout_tally_completion() {
        let mut tally = FanoutTally {
            expected: 3,
            ..Default::default()
        };
        assert!(!tally.is_complete());
        tally.succeeded = 2;
        tally.failed = 1;
        assert!(tally.is_complete());
        assert!(!FanoutTally::default().is_complete());
    }

    #[test]
    fn test_job_input_json() {
        let input: JobInput = serde_json::from_str(r#"{"source": "video", "video_id": "v1"}"#).unwrap();
        assert_eq!(input, JobInput::video("v1"));
        let input: JobInput =
            serde_json::from_str(r#"{"source": "job", "job_id": "j1", "resolution": "720p"}"#)
                .unwrap();
        assert_eq!(input, JobInput::job("j1", Some(Resolution::R720p)));
    }
}
