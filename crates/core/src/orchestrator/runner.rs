//! Job orchestrator implementation.
//!
//! Wires the task queue, worker pool and pipeline executor together and is
//! the entry point for callers:
//! - Registration: probe and store uploaded videos
//! - Submission: validate, reserve queue space, record the job, enqueue
//! - Cancellation: immediate for queued jobs, cooperative for running ones

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactStore, PutMode};
use crate::engine::TransformEngine;
use crate::job::{
    validate_stages, CreateJobRequest, InputProfile, JobFilter, JobInput, JobStatus, JobStore,
    NewVideo, StageSpec, Video,
};
use crate::metrics;
use crate::pipeline::{plan_steps, select_final, PipelineExecutor};
use crate::queue::{QueueError, TaskQueue, WorkUnit, WorkerPool};
use crate::status::{JobStatusView, StatusService};

use super::config::OrchestratorConfig;
use super::types::{OrchestratorError, OrchestratorStatus, SubmitError};

/// Page size used when scanning jobs on startup.
const RECOVERY_PAGE_SIZE: i64 = 200;

/// Interval between status checks in [`JobOrchestrator::wait_for`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The job orchestrator.
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn TransformEngine>,
    artifacts: Arc<dyn ArtifactStore>,
    queue: Arc<TaskQueue>,
    executor: Arc<PipelineExecutor>,
    pool: WorkerPool,
    status: StatusService,
    recovered: AtomicBool,
}

impl JobOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        engine: Arc<dyn TransformEngine>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let executor = Arc::new(PipelineExecutor::new(
            config.pipeline.clone(),
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&artifacts),
            Arc::clone(&queue),
        ));
        let pool = WorkerPool::new(Arc::clone(&queue), executor.clone(), config.workers);
        let status = StatusService::new(Arc::clone(&store), Arc::clone(&artifacts));

        Self {
            store,
            engine,
            artifacts,
            queue,
            executor,
            pool,
            status,
            recovered: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<PipelineExecutor> {
        &self.executor
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Read-only status and result queries.
    pub fn status_service(&self) -> &StatusService {
        &self.status
    }

    /// Start the worker pool.
    ///
    /// On the first start, jobs left `queued` by a previous process are
    /// re-enqueued and jobs left `running` are failed, since their scratch
    /// state did not survive.
    pub async fn start(&self) {
        if !self.recovered.swap(true, Ordering::SeqCst) {
            self.recover().await;
        }
        self.pool.start();
    }

    /// Stop the worker pool after in-flight units finish.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    /// Stop the pool and refuse further work.
    pub async fn shutdown(&self) {
        if self.pool.is_running() {
            self.pool.stop().await;
        }
        self.queue.close();
        info!("Job orchestrator shut down");
    }

    pub fn status(&self) -> OrchestratorStatus {
        let count = |status: JobStatus| {
            self.store
                .count_jobs(&JobFilter::new().with_status(status))
                .unwrap_or(0) as usize
        };
        OrchestratorStatus {
            running: self.pool.is_running(),
            pool: self.pool.status(),
            queued_jobs: count(JobStatus::Queued),
            running_jobs: count(JobStatus::Running),
        }
    }

    // =========================================================================
    // Videos
    // =========================================================================

    /// Probe a source file, copy it into the artifact store and record it.
    pub async fn register_video(&self, path: &Path) -> Result<Video, OrchestratorError> {
        let info = self.engine.probe(path).await?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();
        let key = format!("videos/{}/source.{}", uuid::Uuid::new_v4(), extension);

        let stored = self.artifacts.put(path, &key, PutMode::Copy).await?;
        let video = self.store.insert_video(NewVideo {
            storage_ref: stored.reference,
            duration_secs: info.duration_secs,
            size_bytes: stored.size_bytes,
            width: info.width,
            height: info.height,
        })?;

        info!(
            video_id = %video.id,
            duration_secs = video.duration_secs,
            height = ?video.height,
            "Registered video"
        );
        Ok(video)
    }

    pub fn get_video(&self, video_id: &str) -> Result<Option<Video>, OrchestratorError> {
        Ok(self.store.get_video(video_id)?)
    }

    pub fn list_videos(&self) -> Result<Vec<Video>, OrchestratorError> {
        Ok(self.store.list_videos()?)
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Submit a job. Returns its id once it is recorded and enqueued.
    ///
    /// Processing happens asynchronously on the worker pool.
    pub async fn submit(
        &self,
        input: JobInput,
        stages: Vec<StageSpec>,
    ) -> Result<String, SubmitError> {
        match self.try_submit(input, stages).await {
            Ok(job_id) => {
                metrics::SUBMISSIONS_ACCEPTED.inc();
                Ok(job_id)
            }
            Err(e) => {
                metrics::SUBMISSIONS_REJECTED
                    .with_label_values(&[e.reason()])
                    .inc();
                debug!(error = %e, "Submission rejected");
                Err(e)
            }
        }
    }

    async fn try_submit(
        &self,
        input: JobInput,
        stages: Vec<StageSpec>,
    ) -> Result<String, SubmitError> {
        let (video_id, profile) = self.resolve_input(&input).await?;
        validate_stages(&stages, Some(&profile))?;

        // Reserve before recording so a full queue leaves no job behind.
        let slot = self.queue.try_reserve().map_err(|e| match e {
            QueueError::Backpressure { capacity } => SubmitError::Backpressure { capacity },
            QueueError::Closed => SubmitError::ShuttingDown,
        })?;

        let step_count = plan_steps(&stages).len();
        let job = self.store.create_job(CreateJobRequest {
            input,
            video_id,
            stages,
            step_count,
        })?;
        slot.commit(WorkUnit::step(&job.id, 0));

        info!(job_id = %job.id, kind = job.kind.as_str(), steps = step_count, "Job submitted");
        Ok(job.id)
    }

    /// Source video id and the profile the first stage will see.
    async fn resolve_input(&self, input: &JobInput) -> Result<(String, InputProfile), SubmitError> {
        match input {
            JobInput::Video { video_id } => {
                let video = self
                    .store
                    .get_video(video_id)?
                    .ok_or_else(|| SubmitError::VideoNotFound(video_id.clone()))?;
                Ok((video.id.clone(), video.profile()))
            }
            JobInput::Job { job_id, resolution } => {
                let parent = self
                    .store
                    .get_job(job_id)?
                    .ok_or_else(|| SubmitError::ParentNotFound(job_id.clone()))?;
                if parent.status != JobStatus::Succeeded {
                    return Err(SubmitError::ParentNotReady {
                        job_id: job_id.clone(),
                        status: parent.status,
                    });
                }
                let artifacts = self.store.artifacts(job_id)?;
                let output = select_final(&artifacts, *resolution).ok_or_else(|| {
                    SubmitError::ParentOutputMissing {
                        job_id: job_id.clone(),
                        resolution: *resolution,
                    }
                })?;
                let path = self.artifacts.locate(&output.storage_ref)?;
                let info = self.engine.probe(&path).await?;
                Ok((parent.video_id, info.profile()))
            }
        }
    }

    /// Cancel a job.
    ///
    /// A queued job is canceled at once. A running job is flagged and stops
    /// at its next step boundary; the returned status is then still `running`.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, OrchestratorError> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::AlreadyFinished {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        self.store.request_cancel(job_id)?;

        if job.status == JobStatus::Queued
            && self
                .store
                .compare_and_set_status(job_id, JobStatus::Queued, JobStatus::Canceled, None)?
        {
            metrics::JOBS_FINISHED
                .with_label_values(&[JobStatus::Canceled.as_str()])
                .inc();
            info!(job_id, "Canceled queued job");
            return Ok(JobStatus::Canceled);
        }

        let current = self
            .store
            .get_job(job_id)?
            .map(|j| j.status)
            .unwrap_or(job.status);
        info!(job_id, status = %current, "Cancellation requested");
        Ok(current)
    }

    /// Wait until a job reaches a terminal state.
    pub async fn wait_for(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<JobStatusView, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self
                .store
                .get_job(job_id)?
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(job.into());
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout {
                    job_id: job_id.to_string(),
                    status: job.status,
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    async fn recover(&self) {
        let mut requeued = 0usize;
        for job in self.jobs_in(JobStatus::Queued) {
            // Jobs submitted by this process before the first start are already waiting.
            let unit = WorkUnit::step(&job, 0);
            if self.queue.contains(&unit) {
                continue;
            }
            if let Err(e) = self.queue.push_internal(unit) {
                warn!(job_id = %job, error = %e, "Failed to re-enqueue queued job");
            } else {
                requeued += 1;
            }
        }

        let interrupted = self.jobs_in(JobStatus::Running);
        for job in &interrupted {
            self.executor
                .settle(
                    job,
                    JobStatus::Failed,
                    Some("interrupted by a restart".to_string()),
                )
                .await;
        }

        if requeued > 0 || !interrupted.is_empty() {
            info!(
                requeued,
                interrupted = interrupted.len(),
                "Recovered jobs from a previous run"
            );
        }
    }

    fn jobs_in(&self, status: JobStatus) -> Vec<String> {
        let mut ids = Vec::new();
        let mut offset = 0;
        loop {
            let filter = JobFilter::new()
                .with_status(status)
                .with_limit(RECOVERY_PAGE_SIZE)
                .with_offset(offset);
            match self.store.list_jobs(&filter) {
                Ok(jobs) if !jobs.is_empty() => {
                    offset += jobs.len() as i64;
                    ids.extend(jobs.into_iter().map(|j| j.id));
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(status = %status, error = %e, "Failed to list jobs for recovery");
                    break;
                }
            }
        }
        ids
    }
}
