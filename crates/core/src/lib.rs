pub mod artifact;
pub mod config;
pub mod engine;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod status;
pub mod testing;

pub use artifact::{ArtifactStore, FsArtifactStore, PutMode, ScratchSpace, StorageError};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, LogFormat,
};
pub use engine::{EngineConfig, EngineError, FfmpegEngine, MediaInfo, TransformEngine};
pub use job::{
    Artifact, ArtifactKind, Job, JobFilter, JobInput, JobStatus, JobStore, JobStoreError,
    Resolution, SqliteJobStore, StageSpec, ValidationError, Video,
};
pub use orchestrator::{
    JobOrchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStatus, SubmitError,
};
pub use pipeline::{PipelineConfig, PipelineError, PipelineExecutor, RetryConfig};
pub use queue::{QueueError, TaskQueue, WorkUnit, WorkerPool};
pub use status::{JobStatusView, ResultRef, StatusError, StatusService, VideoStats};
