//! Pipeline executor: runs a job's steps in order and fans out transcodes.
//!
//! The executor is driven one unit at a time, either by the worker pool
//! (through [`UnitHandler`]) or inline through [`PipelineExecutor::execute`].
//! Each step:
//! 1. Claims the job (`queued -> running`) or checks it still owns it
//! 2. Honors a pending cancellation at the step boundary
//! 3. Probes the step's input and re-validates the step against it
//! 4. Invokes the engine under a deadline, retrying transient failures
//! 5. Registers the output and hands the next unit back to the queue
//!
//! Every terminal path goes through [`PipelineExecutor::settle`], which
//! releases the job's scratch space.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::artifact::{sha256_file, ArtifactStore, PutMode, ScratchSpace, StorageError};
use crate::engine::{EngineError, EngineOperation, EngineOutput, EngineRequest, TransformEngine};
use crate::job::{
    Artifact, ArtifactKind, Job, JobInput, JobStatus, JobStore, JobStoreError, NewArtifact,
    Resolution, VariantOutcome,
};
use crate::metrics;
use crate::queue::{TaskQueue, UnitHandler, WorkUnit};

use super::compositor::{describe, plan_steps, Step, ENCODED_EXTENSION};
use super::config::PipelineConfig;
use super::fanout::{resolve_fanout, select_final, VariantErrors};
use super::types::{PipelineError, Progress};

/// Attempts to settle a job before giving up on a racing writer.
const SETTLE_ATTEMPTS: usize = 4;

pub struct PipelineExecutor {
    config: PipelineConfig,
    store: Arc<dyn JobStore>,
    engine: Arc<dyn TransformEngine>,
    artifacts: Arc<dyn ArtifactStore>,
    queue: Arc<TaskQueue>,
    scratch: ScratchSpace,
    variant_errors: VariantErrors,
}

impl PipelineExecutor {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn JobStore>,
        engine: Arc<dyn TransformEngine>,
        artifacts: Arc<dyn ArtifactStore>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        let scratch = ScratchSpace::new(config.scratch_root.clone());
        Self {
            config,
            store,
            engine,
            artifacts,
            queue,
            scratch,
            variant_errors: VariantErrors::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    /// Run a job to completion without going through the queue.
    ///
    /// Steps run in order on the calling task; transcode variants run
    /// concurrently. Returns the job's final artifacts when it succeeds.
    pub async fn execute(&self, job_id: &str) -> Result<Vec<Artifact>, PipelineError> {
        let mut step = 0;
        loop {
            match self.process_step(job_id, step).await? {
                Progress::Next(next) => step = next,
                Progress::FanOut { step, resolutions } => {
                    let variants = resolutions
                        .into_iter()
                        .map(|resolution| self.process_variant(job_id, step, resolution));
                    for result in join_all(variants).await {
                        result?;
                    }
                    break;
                }
                Progress::Finished(_) => break,
                Progress::Stale => {
                    let job = self.load_job(job_id)?;
                    return Err(PipelineError::NotRunnable {
                        job_id: job_id.to_string(),
                        status: job.status,
                    });
                }
            }
        }
        self.outcome(job_id)
    }

    /// Run step `step` of a job.
    ///
    /// Failures are recorded on the job before the error is returned.
    pub async fn process_step(&self, job_id: &str, step: usize) -> Result<Progress, PipelineError> {
        let job = self.load_job(job_id)?;

        // Step 0 units only come from submission, so they must claim the job.
        if step == 0 {
            if job.status != JobStatus::Queued {
                debug!(job_id, status = %job.status, "Discarding start unit for a job already taken");
                return Ok(Progress::Stale);
            }
            if !self
                .store
                .compare_and_set_status(job_id, JobStatus::Queued, JobStatus::Running, None)?
            {
                debug!(job_id, "Job left the queue before it could start");
                return Ok(Progress::Stale);
            }
            info!(job_id, plan = %describe(&job.stages), "Job started");
        } else if job.status != JobStatus::Running || job.current_step != step {
            debug!(
                job_id,
                step,
                status = %job.status,
                current_step = job.current_step,
                "Discarding stale step unit"
            );
            return Ok(Progress::Stale);
        }

        // Reload to see a cancellation requested while the unit was queued.
        let job = self.load_job(job_id)?;
        match self.run_step(&job, step).await {
            Ok(progress) => Ok(progress),
            Err(e) => {
                warn!(job_id, step, error = %e, "Step failed");
                self.settle(job_id, JobStatus::Failed, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Run one resolution variant of a job's transcode step.
    ///
    /// Returns the job's terminal status when this variant was the last one
    /// to finish.
    pub async fn process_variant(
        &self,
        job_id: &str,
        step: usize,
        resolution: Resolution,
    ) -> Result<Option<JobStatus>, PipelineError> {
        let job = self.load_job(job_id)?;
        if job.status != JobStatus::Running || job.current_step != step || job.fanout.is_none() {
            debug!(job_id, %resolution, status = %job.status, "Discarding stale variant unit");
            return Ok(None);
        }

        let outcome = if job.cancel_requested {
            debug!(job_id, %resolution, "Skipping variant of canceled job");
            VariantOutcome::Skipped
        } else {
            match self.run_variant(&job, step, resolution).await {
                Ok(artifact) => {
                    info!(job_id, %resolution, artifact_id = %artifact.id, "Variant succeeded");
                    VariantOutcome::Succeeded
                }
                Err(e) => {
                    warn!(job_id, %resolution, error = %e, "Variant failed");
                    self.variant_errors.record(job_id, resolution, e.to_string());
                    VariantOutcome::Failed
                }
            }
        };

        self.record_variant(job_id, outcome).await
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn run_step(&self, job: &Job, step: usize) -> Result<Progress, PipelineError> {
        if job.cancel_requested {
            info!(job_id = %job.id, step, "Cancellation honored at step boundary");
            let status = self.settle(&job.id, JobStatus::Canceled, None).await;
            return Ok(Progress::Finished(status));
        }

        let plan = plan_steps(&job.stages);
        let current = plan.get(step).ok_or_else(|| PipelineError::UnknownStep {
            job_id: job.id.clone(),
            step,
        })?;

        let input = self.step_input(job, step)?;
        let info = self
            .engine
            .probe(&input)
            .await
            .map_err(|e| PipelineError::engine(current.first_stage(), "probe", e))?;
        current.validate(&job.stages, &info.profile())?;

        let Some(operation) = current.operation() else {
            let resolutions = current.resolutions();
            self.store.begin_fanout(&job.id, resolutions.len() as u32)?;
            info!(job_id = %job.id, step, variants = resolutions.len(), "Fanning out transcode");
            return Ok(Progress::FanOut { step, resolutions });
        };

        let work_dir = self.scratch.ensure(&job.id).await?;
        let extension = current.output_extension(&input);
        let request = EngineRequest {
            job_id: job.id.clone(),
            input_path: input,
            output_path: self.scratch.step_output(&job.id, step, &extension),
            work_dir,
            operation,
        };
        let output = self
            .invoke_with_retry(&request, current.first_stage(), current.label())
            .await?;

        if step + 1 == plan.len() {
            let key = format!("jobs/{}/final.{}", job.id, extension);
            self.register_final(job, current, &output, &key, None).await?;
            let status = self.settle(&job.id, JobStatus::Succeeded, None).await;
            return Ok(Progress::Finished(status));
        }

        let checksum = sha256_file(&output.output_path)
            .await
            .map_err(StorageError::Io)?;
        self.store.add_artifact(NewArtifact {
            job_id: job.id.clone(),
            kind: ArtifactKind::Intermediate,
            step_index: step,
            resolution: None,
            storage_ref: output.output_path.to_string_lossy().into_owned(),
            checksum,
            size_bytes: output.size_bytes,
        })?;

        if !self.store.advance_step(&job.id, step, step + 1)? {
            return Err(PipelineError::LostOwnership {
                job_id: job.id.clone(),
                step,
            });
        }
        debug!(job_id = %job.id, step, "Step completed");
        Ok(Progress::Next(step + 1))
    }

    async fn run_variant(
        &self,
        job: &Job,
        step: usize,
        resolution: Resolution,
    ) -> Result<Artifact, PipelineError> {
        let plan = plan_steps(&job.stages);
        let current = plan.get(step).ok_or_else(|| PipelineError::UnknownStep {
            job_id: job.id.clone(),
            step,
        })?;

        let work_dir = self.scratch.ensure(&job.id).await?;
        let request = EngineRequest {
            job_id: job.id.clone(),
            input_path: self.step_input(job, step)?,
            output_path: self
                .scratch
                .variant_output(&job.id, resolution, ENCODED_EXTENSION),
            work_dir,
            operation: EngineOperation::Transcode { resolution },
        };
        let label = format!("transcode {}", resolution);
        let output = self
            .invoke_with_retry(&request, current.first_stage(), &label)
            .await?;

        let key = format!("jobs/{}/{}.{}", job.id, resolution, ENCODED_EXTENSION);
        self.register_final(job, current, &output, &key, Some(resolution))
            .await
    }

    async fn register_final(
        &self,
        job: &Job,
        step: &Step,
        output: &EngineOutput,
        key: &str,
        resolution: Option<Resolution>,
    ) -> Result<Artifact, PipelineError> {
        let stored = self
            .artifacts
            .put(&output.output_path, key, PutMode::Move)
            .await?;
        let artifact = self.store.add_artifact(NewArtifact {
            job_id: job.id.clone(),
            kind: ArtifactKind::Final,
            step_index: step.index,
            resolution,
            storage_ref: stored.reference,
            checksum: stored.checksum,
            size_bytes: stored.size_bytes,
        })?;
        Ok(artifact)
    }

    /// Where step `step` reads from: the source for step 0, otherwise the
    /// previous step's intermediate output.
    fn step_input(&self, job: &Job, step: usize) -> Result<PathBuf, PipelineError> {
        if step == 0 {
            return self.source_input(job);
        }
        let previous = step - 1;
        self.store
            .artifacts(&job.id)?
            .into_iter()
            .rev()
            .find(|a| a.kind == ArtifactKind::Intermediate && a.step_index == previous)
            .map(|a| PathBuf::from(a.storage_ref))
            .ok_or_else(|| PipelineError::MissingInput(format!("output of step {}", previous)))
    }

    fn source_input(&self, job: &Job) -> Result<PathBuf, PipelineError> {
        match &job.input {
            JobInput::Video { video_id } => {
                let video = self
                    .store
                    .get_video(video_id)?
                    .ok_or_else(|| PipelineError::VideoNotFound(video_id.clone()))?;
                Ok(self.artifacts.locate(&video.storage_ref)?)
            }
            JobInput::Job { job_id, resolution } => {
                let artifacts = self.store.artifacts(job_id)?;
                let parent = select_final(&artifacts, *resolution).ok_or_else(|| {
                    PipelineError::MissingInput(format!("no final output of job {}", job_id))
                })?;
                Ok(self.artifacts.locate(&parent.storage_ref)?)
            }
        }
    }

    /// Invoke the engine under the stage deadline, retrying transient failures.
    async fn invoke_with_retry(
        &self,
        request: &EngineRequest,
        stage_index: usize,
        label: &str,
    ) -> Result<EngineOutput, PipelineError> {
        let operation = request.operation.label();
        let timeout = self.config.stage_timeout();
        let retry = &self.config.retry;
        let _timer = metrics::STEP_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, self.engine.invoke(request)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    timeout_secs: self.config.stage_timeout_secs,
                }),
            };

            let error = match result {
                Ok(output) => {
                    metrics::ENGINE_ATTEMPTS
                        .with_label_values(&[operation, "success"])
                        .inc();
                    return Ok(output);
                }
                Err(e) => e,
            };

            // A failed attempt's output is never reused.
            self.scratch.discard(&request.output_path).await;

            let retryable = error.is_retryable();
            metrics::ENGINE_ATTEMPTS
                .with_label_values(&[operation, if retryable { "transient" } else { "fatal" }])
                .inc();

            if !retryable || attempt >= retry.max_attempts {
                return Err(PipelineError::engine(stage_index, label, error));
            }

            let delay = retry.delay_for_retry(attempt);
            warn!(
                job_id = %request.job_id,
                operation = label,
                attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient engine failure, retrying"
            );
            metrics::ENGINE_RETRIES.with_label_values(&[operation]).inc();
            tokio::time::sleep(delay).await;
        }
    }

    // =========================================================================
    // Terminal states
    // =========================================================================

    async fn record_variant(
        &self,
        job_id: &str,
        outcome: VariantOutcome,
    ) -> Result<Option<JobStatus>, PipelineError> {
        let tally = match self.store.record_variant_outcome(job_id, outcome) {
            Ok(tally) => tally,
            Err(e) => {
                self.settle(job_id, JobStatus::Failed, Some(e.to_string())).await;
                return Err(e.into());
            }
        };
        debug!(
            job_id,
            expected = tally.expected,
            succeeded = tally.succeeded,
            failed = tally.failed,
            skipped = tally.skipped,
            "Variant recorded"
        );

        let Some(status) = resolve_fanout(&tally) else {
            return Ok(None);
        };
        let detail = match status {
            JobStatus::Failed => Some(
                self.variant_errors
                    .take_summary(job_id)
                    .unwrap_or_else(|| format!("{} of {} variants failed", tally.failed, tally.expected)),
            ),
            _ => None,
        };
        Ok(Some(self.settle(job_id, status, detail).await))
    }

    /// Move a job to a terminal state and release its scratch space.
    ///
    /// Returns the job's actual terminal status, which differs from `target`
    /// when another path finished the job first.
    pub async fn settle(&self, job_id: &str, target: JobStatus, detail: Option<String>) -> JobStatus {
        let status = match self.transition_to_terminal(job_id, target, detail) {
            Ok((status, changed)) => {
                if changed {
                    metrics::JOBS_FINISHED
                        .with_label_values(&[status.as_str()])
                        .inc();
                    info!(job_id, status = %status, "Job finished");
                }
                status
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to record terminal state");
                target
            }
        };

        if let Err(e) = self.scratch.release(job_id).await {
            warn!(job_id, error = %e, "Failed to release scratch space");
        }
        if let Err(e) = self.store.remove_intermediate_artifacts(job_id) {
            warn!(job_id, error = %e, "Failed to drop intermediate artifact records");
        }
        self.variant_errors.take_summary(job_id);

        status
    }

    fn transition_to_terminal(
        &self,
        job_id: &str,
        mut target: JobStatus,
        mut detail: Option<String>,
    ) -> Result<(JobStatus, bool), JobStoreError> {
        for _ in 0..SETTLE_ATTEMPTS {
            let current = self
                .store
                .get_job(job_id)?
                .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?
                .status;
            if current.is_terminal() {
                return Ok((current, false));
            }

            // A queued job can only fail by passing through running.
            let next = if current.can_transition_to(target) {
                target
            } else {
                JobStatus::Running
            };
            let next_detail = if next == target { detail.as_deref() } else { None };

            match self
                .store
                .compare_and_set_status(job_id, current, next, next_detail)
            {
                Ok(true) if next == target => return Ok((target, true)),
                Ok(_) => continue,
                Err(JobStoreError::InvalidTransition { from, to, .. }) => {
                    error!(job_id, %from, %to, "Invalid transition, forcing job to failed");
                    target = JobStatus::Failed;
                    detail = Some(format!("internal error: invalid transition {} -> {}", from, to));
                }
                Err(e) => return Err(e),
            }
        }
        Err(JobStoreError::Database(format!(
            "could not settle job {} after {} attempts",
            job_id, SETTLE_ATTEMPTS
        )))
    }

    fn outcome(&self, job_id: &str) -> Result<Vec<Artifact>, PipelineError> {
        let job = self.load_job(job_id)?;
        match job.status {
            JobStatus::Succeeded => Ok(self
                .store
                .artifacts(job_id)?
                .into_iter()
                .filter(|a| a.kind == ArtifactKind::Final)
                .collect()),
            JobStatus::Canceled => Err(PipelineError::Canceled(job_id.to_string())),
            JobStatus::Failed => Err(PipelineError::JobFailed {
                job_id: job_id.to_string(),
                detail: job.error_detail.unwrap_or_default(),
            }),
            status => Err(PipelineError::NotRunnable {
                job_id: job_id.to_string(),
                status,
            }),
        }
    }

    fn load_job(&self, job_id: &str) -> Result<Job, PipelineError> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))
    }

    async fn enqueue(&self, unit: WorkUnit) {
        if let Err(e) = self.queue.push_internal(unit.clone()) {
            warn!(unit = %unit, error = %e, "Could not enqueue continuation");
            self.settle(
                unit.job_id(),
                JobStatus::Failed,
                Some(format!("could not schedule {}: {}", unit, e)),
            )
            .await;
        }
    }
}

#[async_trait]
impl UnitHandler for PipelineExecutor {
    async fn handle(&self, unit: WorkUnit) {
        match unit {
            WorkUnit::Step { job_id, step } => match self.process_step(&job_id, step).await {
                Ok(Progress::Next(next)) => self.enqueue(WorkUnit::step(&job_id, next)).await,
                Ok(Progress::FanOut { step, resolutions }) => {
                    for resolution in resolutions {
                        self.enqueue(WorkUnit::variant(&job_id, step, resolution))
                            .await;
                    }
                }
                Ok(Progress::Finished(_)) | Ok(Progress::Stale) => {}
                Err(e) => debug!(job_id = %job_id, step, error = %e, "Step unit ended with error"),
            },
            WorkUnit::Variant {
                job_id,
                step,
                resolution,
            } => {
                if let Err(e) = self.process_variant(&job_id, step, resolution).await {
                    debug!(job_id = %job_id, %resolution, error = %e, "Variant unit ended with error");
                }
            }
        }
    }

    async fn handle_panic(&self, unit: WorkUnit, message: String) {
        match unit {
            WorkUnit::Step { job_id, step } => {
                self.settle(
                    &job_id,
                    JobStatus::Failed,
                    Some(format!("step {} panicked: {}", step, message)),
                )
                .await;
            }
            WorkUnit::Variant {
                job_id, resolution, ..
            } => {
                self.variant_errors.record(
                    &job_id,
                    resolution,
                    format!("transcode {} panicked: {}", resolution, message),
                );
                if let Err(e) = self.record_variant(&job_id, VariantOutcome::Failed).await {
                    error!(job_id = %job_id, error = %e, "Failed to record panicked variant");
                }
            }
        }
    }
}
