//! Types for the transformation engine contract.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::{InputProfile, OverlaySpec, Resolution, WatermarkSpec};

/// Information about a media file as reported by a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// File path.
    pub path: PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Duration in seconds.
    pub duration_secs: f64,
    /// Container format (e.g., "mov", "matroska").
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub has_audio: bool,
}

impl MediaInfo {
    pub fn profile(&self) -> InputProfile {
        InputProfile::new(self.duration_secs, self.height)
    }
}

/// One layer drawn by a composite operation, bottom to top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum Layer {
    Overlay(OverlaySpec),
    Watermark(WatermarkSpec),
}

/// The operation an engine invocation performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EngineOperation {
    /// Cut `[start, end)` seconds without re-encoding.
    Trim { start: f64, end: f64 },
    /// Draw layers over the base stream in the given order.
    Composite { layers: Vec<Layer> },
    /// Re-encode to one resolution tier.
    Transcode { resolution: Resolution },
}

impl EngineOperation {
    /// Short name used in logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            EngineOperation::Trim { .. } => "trim",
            EngineOperation::Composite { .. } => "composite",
            EngineOperation::Transcode { .. } => "transcode",
        }
    }
}

/// One invocation of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Job-scoped directory for auxiliary files such as overlay text.
    pub work_dir: PathBuf,
    pub operation: EngineOperation,
}

/// Result of a successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    /// Wall-clock time of the invocation in milliseconds.
    pub duration_ms: u64,
}
