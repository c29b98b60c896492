//! Error types for the engine module.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a transformation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine binary not found.
    #[error("Engine binary not found at path: {path}")]
    ToolNotFound { path: PathBuf },

    /// Input file not found.
    #[error("Input file not found: {path}")]
    InputNotFound { path: PathBuf },

    /// Invocation exceeded its deadline.
    #[error("Invocation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// I/O error while running the engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine exited with an error.
    #[error("Engine failed (code {code:?}): {message}")]
    Failed {
        code: Option<i32>,
        message: String,
        transient: bool,
    },

    /// The input could not be decoded.
    #[error("Corrupt input: {reason}")]
    CorruptInput { reason: String },

    /// Codec, filter or format not supported by the engine.
    #[error("Unsupported: {reason}")]
    Unsupported { reason: String },

    /// The engine reported success but produced no output.
    #[error("Output file not created: {path}")]
    OutputMissing { path: PathBuf },

    /// Failed to probe a media file.
    #[error("Failed to probe media file: {reason}")]
    ProbeFailed { reason: String },
}

impl EngineError {
    /// Creates a failure that is worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Failed {
            code: None,
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a failure that must not be retried.
    pub fn fatal(code: Option<i32>, message: impl Into<String>) -> Self {
        Self::Failed {
            code,
            message: message.into(),
            transient: false,
        }
    }

    /// Creates a new probe failed error.
    pub fn probe_failed(reason: impl Into<String>) -> Self {
        Self::ProbeFailed {
            reason: reason.into(),
        }
    }

    /// Whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Io(_) | Self::Failed { transient: true, .. }
        )
    }

    /// Stable short code for error details and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::InputNotFound { .. } => "input_not_found",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::Failed { .. } => "engine_failed",
            Self::CorruptInput { .. } => "corrupt_input",
            Self::Unsupported { .. } => "unsupported",
            Self::OutputMissing { .. } => "output_missing",
            Self::ProbeFailed { .. } => "probe_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(EngineError::Timeout { timeout_secs: 5 }.is_retryable());
        assert!(EngineError::Io(std::io::Error::other("disk hiccup")).is_retryable());
        assert!(EngineError::transient("busy").is_retryable());

        assert!(!EngineError::fatal(Some(1), "bad filter").is_retryable());
        assert!(!EngineError::CorruptInput {
            reason: "moov atom not found".into()
        }
        .is_retryable());
        assert!(!EngineError::Unsupported {
            reason: "codec".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::Timeout { timeout_secs: 1 }.code(), "timeout");
        assert_eq!(EngineError::fatal(None, "x").code(), "engine_failed");
    }
}
