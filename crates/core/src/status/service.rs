//! Read-only projection over the job store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::artifact::ArtifactStore;
use crate::job::{ArtifactKind, JobFilter, JobStore, Resolution, StatusTransition};
use crate::pipeline::select_final;

use super::types::{JobStatusView, ResultRef, StatusError, VideoStats};

/// Page size used when aggregating over every job of a video.
const STATS_PAGE_SIZE: i64 = 500;

/// Answers status and result queries. Never blocks on running jobs.
pub struct StatusService {
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }

    /// Current status of a job.
    pub fn get_status(&self, job_id: &str) -> Result<JobStatusView, StatusError> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| StatusError::JobNotFound(job_id.to_string()))?;
        Ok(job.into())
    }

    /// A finished job's output.
    ///
    /// With a resolution, that tier's output; without one, the highest tier
    /// available (or the single output of a job without tiers). Failed and
    /// canceled jobs still serve the variants they produced.
    pub fn get_result(
        &self,
        job_id: &str,
        resolution: Option<Resolution>,
    ) -> Result<ResultRef, StatusError> {
        self.ensure_finished(job_id)?;

        let artifacts = self.store.artifacts(job_id)?;
        let artifact = select_final(&artifacts, resolution)
            .cloned()
            .ok_or_else(|| StatusError::ArtifactNotFound {
                job_id: job_id.to_string(),
                resolution,
            })?;
        let path = self.artifacts.locate(&artifact.storage_ref)?;
        Ok(ResultRef::new(artifact, path))
    }

    /// Every final output of a finished job, highest tier first.
    pub fn list_results(&self, job_id: &str) -> Result<Vec<ResultRef>, StatusError> {
        self.ensure_finished(job_id)?;

        let mut finals: Vec<_> = self
            .store
            .artifacts(job_id)?
            .into_iter()
            .filter(|a| a.kind == ArtifactKind::Final)
            .collect();
        finals.sort_by(|a, b| b.resolution.cmp(&a.resolution));

        finals
            .into_iter()
            .map(|artifact| {
                let path = self.artifacts.locate(&artifact.storage_ref)?;
                Ok(ResultRef::new(artifact, path))
            })
            .collect()
    }

    /// Timestamped status transitions of a job, oldest first.
    pub fn history(&self, job_id: &str) -> Result<Vec<StatusTransition>, StatusError> {
        if self.store.get_job(job_id)?.is_none() {
            return Err(StatusError::JobNotFound(job_id.to_string()));
        }
        Ok(self.store.transitions(job_id)?)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobStatusView>, StatusError> {
        Ok(self
            .store
            .list_jobs(filter)?
            .into_iter()
            .map(JobStatusView::from)
            .collect())
    }

    pub fn count_jobs(&self, filter: &JobFilter) -> Result<i64, StatusError> {
        Ok(self.store.count_jobs(filter)?)
    }

    /// Aggregate job numbers for a source video.
    pub fn video_stats(&self, video_id: &str) -> Result<VideoStats, StatusError> {
        let video = self
            .store
            .get_video(video_id)?
            .ok_or_else(|| StatusError::VideoNotFound(video_id.to_string()))?;

        let mut stats = VideoStats {
            video_id: video.id.clone(),
            duration_secs: video.duration_secs,
            size_bytes: video.size_bytes,
            width: video.width,
            height: video.height,
            ..Default::default()
        };
        let mut jobs_by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut jobs_by_stage: BTreeMap<String, usize> = BTreeMap::new();
        let mut resolutions: BTreeSet<Resolution> = BTreeSet::new();

        let mut offset = 0;
        loop {
            let filter = JobFilter::new()
                .with_video(video_id)
                .with_limit(STATS_PAGE_SIZE)
                .with_offset(offset);
            let jobs = self.store.list_jobs(&filter)?;
            if jobs.is_empty() {
                break;
            }
            offset += jobs.len() as i64;

            for job in &jobs {
                stats.total_jobs += 1;
                *jobs_by_status.entry(job.status.to_string()).or_default() += 1;

                let kinds: BTreeSet<&str> = job.stages.iter().map(|s| s.kind().as_str()).collect();
                for kind in kinds {
                    *jobs_by_stage.entry(kind.to_string()).or_default() += 1;
                }

                resolutions.extend(
                    self.store
                        .artifacts(&job.id)?
                        .into_iter()
                        .filter(|a| a.kind == ArtifactKind::Final)
                        .filter_map(|a| a.resolution),
                );
            }
        }

        stats.jobs_by_status = jobs_by_status;
        stats.jobs_by_stage = jobs_by_stage;
        stats.resolutions = resolutions;
        Ok(stats)
    }

    fn ensure_finished(&self, job_id: &str) -> Result<(), StatusError> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| StatusError::JobNotFound(job_id.to_string()))?;
        if !job.status.is_terminal() {
            return Err(StatusError::NotReady {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        Ok(())
    }
}
