//! Testing utilities and mock implementations for end-to-end tests.
//!
//! Provides a deterministic [`MockEngine`] and fixtures that wire a complete
//! orchestrator over an in-memory job store and a directory on disk, so the
//! whole pipeline can run without ffmpeg.
//!
//! # Example
//!
//! ```rust,ignore
//! use vidpipe_core::testing::{fixtures, MockEngine};
//!
//! let dir = tempfile::tempdir()?;
//! let engine = Arc::new(MockEngine::new());
//! let orchestrator = fixtures::orchestrator(dir.path(), engine.clone(), fixtures::fast_config(dir.path()));
//! let source = fixtures::write_video(dir.path(), "clip.mp4", 30.0, Some(1080)).await?;
//! let video = orchestrator.register_video(&source).await?;
//! ```

mod mock_engine;

pub use mock_engine::{FailureTarget, MockEngine, MockMedia};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::{MockEngine, MockMedia};
    use crate::artifact::FsArtifactStore;
    use crate::job::SqliteJobStore;
    use crate::orchestrator::{JobOrchestrator, OrchestratorConfig};
    use crate::pipeline::{PipelineConfig, RetryConfig};

    /// Write a source file the mock engine can probe.
    pub async fn write_video(
        dir: &Path,
        name: &str,
        duration_secs: f64,
        height: Option<u32>,
    ) -> std::io::Result<PathBuf> {
        let path = dir.join(name);
        tokio::fs::write(&path, MockMedia::new(duration_secs, height).to_bytes()).await?;
        Ok(path)
    }

    /// Config with scratch under `root`, immediate retries and a short deadline.
    pub fn fast_config(root: &Path) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_queue_capacity(16)
            .with_workers(2)
            .with_pipeline(
                PipelineConfig::default()
                    .with_scratch_root(root.join("scratch"))
                    .with_stage_timeout(5)
                    .with_retry(RetryConfig::immediate(3)),
            )
    }

    /// An orchestrator over an in-memory store and artifacts under `root/artifacts`.
    pub fn orchestrator(
        root: &Path,
        engine: Arc<MockEngine>,
        config: OrchestratorConfig,
    ) -> JobOrchestrator {
        // An in-memory SQLite connection only fails on allocation failure.
        let store = SqliteJobStore::in_memory().expect("in-memory job store");
        JobOrchestrator::new(
            config,
            Arc::new(store),
            engine,
            Arc::new(FsArtifactStore::new(root.join("artifacts"))),
        )
    }
}
