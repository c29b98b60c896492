//! Pipeline lifecycle integration tests.
//!
//! These tests run jobs inline through the pipeline executor with the mock
//! engine, without the worker pool:
//! - Step chaining and final artifact registration
//! - Partial fan-out failure
//! - Invocation deadlines
//! - Scratch space release

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use vidpipe_core::{
    job::{ArtifactKind, JobInput, JobStatus, StageSpec, WatermarkSpec},
    orchestrator::{JobOrchestrator, OrchestratorConfig},
    pipeline::{PipelineConfig, PipelineError, RetryConfig},
    testing::{fixtures, FailureTarget, MockEngine},
    Resolution, Video,
};

/// Test helper exposing the executor of an orchestrator that is never started.
struct TestHarness {
    orchestrator: JobOrchestrator,
    engine: Arc<MockEngine>,
    dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(|config| config)
    }

    fn with_config(adjust: impl FnOnce(OrchestratorConfig) -> OrchestratorConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let engine = Arc::new(MockEngine::new());
        let config = adjust(fixtures::fast_config(dir.path()));
        let orchestrator = fixtures::orchestrator(dir.path(), engine.clone(), config);
        Self {
            orchestrator,
            engine,
            dir,
        }
    }

    async fn video(&self, duration_secs: f64) -> Video {
        let path = fixtures::write_video(self.dir.path(), "input.mp4", duration_secs, Some(1080))
            .await
            .expect("Failed to write source");
        self.orchestrator.register_video(&path).await.unwrap()
    }

    async fn submit(&self, video: &Video, stages: Vec<StageSpec>) -> String {
        self.orchestrator
            .submit(JobInput::video(&video.id), stages)
            .await
            .unwrap()
    }

    fn status(&self, job_id: &str) -> JobStatus {
        self.orchestrator
            .store()
            .get_job(job_id)
            .unwrap()
            .unwrap()
            .status
    }
}

#[tokio::test]
async fn test_execute_returns_final_outputs() {
    let h = TestHarness::new();
    let video = h.video(40.0).await;
    let job_id = h
        .submit(
            &video,
            vec![
                StageSpec::trim(5.0, 25.0),
                StageSpec::Watermark(WatermarkSpec::new("/logo.png")),
                StageSpec::transcode([Resolution::R720p, Resolution::R480p]),
            ],
        )
        .await;

    let finals = h.orchestrator.executor().execute(&job_id).await.unwrap();

    assert_eq!(finals.len(), 2);
    assert!(finals.iter().all(|a| a.kind == ArtifactKind::Final));
    assert!(finals.iter().all(|a| a.step_index == 2));
    assert_eq!(h.status(&job_id), JobStatus::Succeeded);

    // Each step reads the previous step's output.
    let requests = h.engine.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[1].input_path, requests[0].output_path);
    assert!(requests[2..]
        .iter()
        .all(|r| r.input_path == requests[1].output_path));

    assert!(!h.orchestrator.executor().scratch().job_dir(&job_id).exists());
}

#[tokio::test]
async fn test_execute_reports_partial_failure() {
    let h = TestHarness::new();
    let video = h.video(20.0).await;
    h.engine
        .fail_always(FailureTarget::Resolution(Resolution::R480p), false);
    let job_id = h
        .submit(
            &video,
            vec![StageSpec::transcode([
                Resolution::R1080p,
                Resolution::R720p,
                Resolution::R480p,
            ])],
        )
        .await;

    let err = h.orchestrator.executor().execute(&job_id).await.unwrap_err();
    match err {
        PipelineError::JobFailed { detail, .. } => assert!(detail.contains("480p"), "{}", detail),
        other => panic!("expected job failure, got {}", other),
    }
    assert_eq!(h.status(&job_id), JobStatus::Failed);

    let finals = h.orchestrator.store().artifacts(&job_id).unwrap();
    assert_eq!(finals.len(), 2);
    assert!(!h.orchestrator.executor().scratch().job_dir(&job_id).exists());
}

#[tokio::test]
async fn test_execute_rejects_finished_job() {
    let h = TestHarness::new();
    let video = h.video(20.0).await;
    let job_id = h.submit(&video, vec![StageSpec::trim(0.0, 5.0)]).await;
    h.orchestrator.cancel(&job_id).await.unwrap();

    let err = h.orchestrator.executor().execute(&job_id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::NotRunnable {
            status: JobStatus::Canceled,
            ..
        }
    ));
    assert_eq!(h.engine.invocations(), 0);
}

#[tokio::test]
async fn test_step_failure_releases_scratch() {
    let h = TestHarness::new();
    let video = h.video(20.0).await;
    h.engine
        .fail_always(FailureTarget::Operation("composite"), false);
    let job_id = h
        .submit(
            &video,
            vec![
                StageSpec::trim(0.0, 10.0),
                StageSpec::Watermark(WatermarkSpec::new("/logo.png")),
            ],
        )
        .await;

    let err = h.orchestrator.executor().execute(&job_id).await.unwrap_err();
    assert!(
        matches!(err, PipelineError::Engine { stage_index: 1, .. }),
        "{}",
        err
    );
    assert_eq!(h.status(&job_id), JobStatus::Failed);

    // The trim output was recorded as an intermediate and is gone now.
    assert!(h.orchestrator.store().artifacts(&job_id).unwrap().is_empty());
    assert!(!h.orchestrator.executor().scratch().job_dir(&job_id).exists());
}

#[tokio::test]
async fn test_invocation_deadline_is_enforced() {
    let h = TestHarness::with_config(|config| {
        config.with_pipeline(
            PipelineConfig::default()
                .with_scratch_root(std::env::temp_dir().join(format!(
                    "vidpipe-deadline-{}",
                    std::process::id()
                )))
                .with_stage_timeout(1)
                .with_retry(RetryConfig::immediate(2)),
        )
    });
    let video = h.video(20.0).await;
    h.engine.set_latency(Duration::from_millis(1500));
    let job_id = h.submit(&video, vec![StageSpec::trim(0.0, 5.0)]).await;

    let err = h.orchestrator.executor().execute(&job_id).await.unwrap_err();
    assert!(err.to_string().contains("timed out"), "{}", err);
    assert_eq!(h.engine.invocations(), 2);
    assert_eq!(h.status(&job_id), JobStatus::Failed);
}

#[tokio::test]
async fn test_settle_routes_queued_job_through_running() {
    let h = TestHarness::new();
    let video = h.video(20.0).await;
    let job_id = h.submit(&video, vec![StageSpec::trim(0.0, 5.0)]).await;

    let status = h
        .orchestrator
        .executor()
        .settle(&job_id, JobStatus::Failed, Some("source vanished".to_string()))
        .await;
    assert_eq!(status, JobStatus::Failed);

    let service = h.orchestrator.status_service();
    let history: Vec<_> = service
        .history(&job_id)
        .unwrap()
        .into_iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        history,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Failed]
    );
    assert_eq!(
        service.get_status(&job_id).unwrap().error_detail.as_deref(),
        Some("source vanished")
    );

    // Settling again leaves the first outcome in place.
    let status = h
        .orchestrator
        .executor()
        .settle(&job_id, JobStatus::Succeeded, None)
        .await;
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(service.history(&job_id).unwrap().len(), 3);
    assert_eq!(h.engine.invocations(), 0);
}
