//! Jobs, their lifecycle state machine and durable storage.

mod sqlite_store;
mod stage;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use stage::{
    validate_stages, EncodingLadder, InputProfile, OverlayKind, OverlaySpec, Position,
    Resolution, StageKind, StageSpec, StageValidationError, TextStyle, TranscodeSpec, TrimSpec,
    ValidationError, WatermarkSpec, DURATION_TOLERANCE_SECS,
};
pub use store::{JobStore, JobStoreError};
pub use types::{
    Artifact, ArtifactKind, CreateJobRequest, FanoutTally, Job, JobFilter, JobInput, JobKind,
    JobStatus, NewArtifact, NewVideo, StatusTransition, VariantOutcome, Video,
};
