//! Runs a manifest against an orchestrator and collects a report.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use vidpipe_core::{
    metrics, JobInput, JobOrchestrator, JobStatus, ResultRef, SubmitError, Video,
};

use crate::manifest::{InputRef, JobEntry, Manifest};

/// Pause between submission attempts while the queue is full.
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub videos: Vec<VideoReport>,
    pub jobs: Vec<JobReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
}

impl Report {
    /// Whether every video registered and every job succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.videos.iter().all(|v| v.error.is_none())
            && self
                .jobs
                .iter()
                .all(|j| j.status == Some(JobStatus::Succeeded))
    }
}

#[derive(Debug, Serialize)]
pub struct VideoReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Video>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<ResultRef>,
}

impl JobReport {
    fn rejected(name: &str, error: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            job_id: None,
            status: None,
            error: Some(error.to_string()),
            results: Vec::new(),
        }
    }
}

/// Register every video, then submit and await every job in manifest order.
///
/// A job whose input comes from another job is submitted once that job has
/// finished. Independent jobs run concurrently on the worker pool.
pub async fn run_batch(orchestrator: &JobOrchestrator, manifest: &Manifest) -> Report {
    let mut report = Report::default();
    let timeout = Duration::from_secs(manifest.wait_timeout_secs);

    let mut videos: HashMap<&str, String> = HashMap::new();
    for entry in &manifest.videos {
        match orchestrator.register_video(&entry.path).await {
            Ok(video) => {
                info!(name = %entry.name, video_id = %video.id, "Registered video");
                videos.insert(entry.name.as_str(), video.id.clone());
                report.videos.push(VideoReport {
                    name: entry.name.clone(),
                    video: Some(video),
                    error: None,
                });
            }
            Err(e) => {
                warn!(name = %entry.name, error = %e, "Failed to register video");
                report.videos.push(VideoReport {
                    name: entry.name.clone(),
                    video: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    let mut submitted: HashMap<&str, String> = HashMap::new();
    let mut order: Vec<(&JobEntry, Option<String>, Option<String>)> = Vec::new();
    for entry in &manifest.jobs {
        let input = match &entry.input {
            InputRef::Video(name) => match videos.get(name.as_str()) {
                Some(id) => JobInput::video(id),
                None => {
                    order.push((entry, None, Some(format!("video '{}' was not registered", name))));
                    continue;
                }
            },
            InputRef::Job(name) => match submitted.get(name.as_str()) {
                Some(parent) => {
                    // The parent must have succeeded before a child can read it.
                    if let Err(e) = orchestrator.wait_for(parent, timeout).await {
                        order.push((entry, None, Some(e.to_string())));
                        continue;
                    }
                    JobInput::job(parent, entry.resolution)
                }
                None => {
                    order.push((entry, None, Some(format!("job '{}' was not submitted", name))));
                    continue;
                }
            },
        };

        match submit_with_backoff(orchestrator, input, entry, timeout).await {
            Ok(job_id) => {
                info!(name = %entry.name, job_id = %job_id, "Submitted job");
                submitted.insert(entry.name.as_str(), job_id.clone());
                order.push((entry, Some(job_id), None));
            }
            Err(e) => {
                warn!(name = %entry.name, error = %e, "Submission rejected");
                order.push((entry, None, Some(e.to_string())));
            }
        }
    }

    for (entry, job_id, error) in order {
        let Some(job_id) = job_id else {
            report
                .jobs
                .push(JobReport::rejected(&entry.name, error.unwrap_or_default()));
            continue;
        };
        report.jobs.push(collect(orchestrator, &entry.name, job_id, timeout).await);
    }

    if manifest.include_metrics {
        report.metrics = Some(metrics::render_metrics());
    }
    report
}

/// Submit, waiting out backpressure until `timeout` elapses.
async fn submit_with_backoff(
    orchestrator: &JobOrchestrator,
    input: JobInput,
    entry: &JobEntry,
    timeout: Duration,
) -> Result<String, SubmitError> {
    let deadline = Instant::now() + timeout;
    loop {
        match orchestrator.submit(input.clone(), entry.stages.clone()).await {
            Err(e) if e.is_backpressure() && Instant::now() < deadline => {
                info!(name = %entry.name, "Queue full, retrying submission");
                tokio::time::sleep(BACKPRESSURE_RETRY).await;
            }
            other => return other,
        }
    }
}

async fn collect(
    orchestrator: &JobOrchestrator,
    name: &str,
    job_id: String,
    timeout: Duration,
) -> JobReport {
    let view = match orchestrator.wait_for(&job_id, timeout).await {
        Ok(view) => view,
        Err(e) => {
            return JobReport {
                name: name.to_string(),
                job_id: Some(job_id),
                status: None,
                error: Some(e.to_string()),
                results: Vec::new(),
            }
        }
    };

    let results = match orchestrator.status_service().list_results(&job_id) {
        Ok(results) => results,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to list results");
            Vec::new()
        }
    };

    JobReport {
        name: name.to_string(),
        job_id: Some(job_id),
        status: Some(view.status),
        error: view.error_detail,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use vidpipe_core::testing::{fixtures, FailureTarget, MockEngine};
    use vidpipe_core::Resolution;

    async fn setup(dir: &std::path::Path, engine: Arc<MockEngine>) -> JobOrchestrator {
        fixtures::write_video(dir, "clip.mp4", 30.0, Some(1080))
            .await
            .unwrap();
        let orchestrator =
            fixtures::orchestrator(dir, engine, fixtures::fast_config(dir));
        orchestrator.start().await;
        orchestrator
    }

    fn manifest(dir: &std::path::Path, jobs: &str) -> Manifest {
        let text = format!(
            r#"{{ "videos": [{{ "name": "clip", "path": "clip.mp4" }}],
                  "wait_timeout_secs": 10, "jobs": {} }}"#,
            jobs
        );
        let path = dir.join("batch.json");
        std::fs::write(&path, text).unwrap();
        Manifest::load(&path).unwrap()
    }

    #[tokio::test]
    async fn test_batch_runs_chained_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        let orchestrator = setup(dir.path(), engine.clone()).await;
        let manifest = manifest(
            dir.path(),
            r#"[
                { "name": "short", "input": { "video": "clip" },
                  "stages": [{ "stage": "trim", "start": 0, "end": 10 }] },
                { "name": "ladder", "input": { "job": "short" },
                  "stages": [{ "stage": "transcode", "target_resolutions": ["720p", "480p"] }] }
            ]"#,
        );

        let report = run_batch(&orchestrator, &manifest).await;
        assert!(report.all_succeeded(), "{:?}", report);
        assert_eq!(report.jobs[0].results.len(), 1);
        let tiers: Vec<_> = report.jobs[1]
            .results
            .iter()
            .filter_map(|r| r.resolution)
            .collect();
        assert_eq!(tiers, vec![Resolution::R720p, Resolution::R480p]);
        assert_eq!(engine.invocations(), 3);

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_batch_reports_rejections_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        engine.fail_always(FailureTarget::Operation("trim"), false);
        let orchestrator = setup(dir.path(), engine).await;
        let manifest = manifest(
            dir.path(),
            r#"[
                { "name": "bad", "input": { "video": "clip" },
                  "stages": [{ "stage": "trim", "start": 5, "end": 5 }] },
                { "name": "fails", "input": { "video": "clip" },
                  "stages": [{ "stage": "trim", "start": 0, "end": 5 }] },
                { "name": "child", "input": { "job": "fails" },
                  "stages": [{ "stage": "trim", "start": 0, "end": 1 }] }
            ]"#,
        );

        let report = run_batch(&orchestrator, &manifest).await;
        assert!(!report.all_succeeded());

        assert!(report.jobs[0].job_id.is_none());
        assert!(report.jobs[0].error.as_deref().unwrap().contains("stage 0"));

        assert_eq!(report.jobs[1].status, Some(JobStatus::Failed));
        assert!(report.jobs[1].results.is_empty());

        // The parent failed, so the child is never created.
        assert!(report.jobs[2].job_id.is_none());
        assert!(report.jobs[2].error.is_some());

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_batch_includes_metrics_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(dir.path(), Arc::new(MockEngine::new())).await;
        let mut manifest = manifest(dir.path(), "[]");
        manifest.include_metrics = true;

        let report = run_batch(&orchestrator, &manifest).await;
        assert!(report.jobs.is_empty());
        assert!(report
            .metrics
            .as_deref()
            .unwrap()
            .contains("vidpipe_"));

        orchestrator.stop().await;
    }
}
