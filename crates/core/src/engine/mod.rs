//! Transformation engine contract and the FFmpeg implementation.
//!
//! The engine performs one media operation per invocation (trim, composite
//! or single-resolution transcode) from an explicit input path to an explicit
//! output path. Errors are classified as transient or fatal through
//! [`EngineError::is_retryable`].

mod config;
mod error;
mod ffmpeg;
mod traits;
mod types;

pub use config::EngineConfig;
pub use error::EngineError;
pub use ffmpeg::{overlay_text_path, FfmpegEngine};
pub use traits::TransformEngine;
pub use types::{EngineOperation, EngineOutput, EngineRequest, Layer, MediaInfo};
