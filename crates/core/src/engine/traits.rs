//! Trait definitions for the engine module.

use async_trait::async_trait;
use std::path::Path;

use super::error::EngineError;
use super::types::{EngineOutput, EngineRequest, MediaInfo};

/// An external tool that performs media transformations.
///
/// Invocations must be deterministic: the same input bytes and request
/// parameters produce the same output bytes.
#[async_trait]
pub trait TransformEngine: Send + Sync {
    /// Returns the name of this engine implementation.
    fn name(&self) -> &str;

    /// Probes a media file to get its information.
    async fn probe(&self, path: &Path) -> Result<MediaInfo, EngineError>;

    /// Runs one operation from `request.input_path` to `request.output_path`.
    async fn invoke(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError>;

    /// Validates that the engine is properly configured and ready.
    async fn validate(&self) -> Result<(), EngineError>;
}
