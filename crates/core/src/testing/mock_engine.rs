//! Mock transformation engine for testing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::engine::{
    EngineError, EngineOperation, EngineOutput, EngineRequest, MediaInfo, TransformEngine,
};
use crate::job::Resolution;

/// Contents of every file the mock engine reads and writes.
///
/// Source fixtures are written in the same shape, so probes of sources,
/// intermediates and outputs all work the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockMedia {
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Digest over the input bytes and the operation that produced this file.
    #[serde(default)]
    pub digest: String,
}

impl MockMedia {
    pub fn new(duration_secs: f64, height: Option<u32>) -> Self {
        Self {
            duration_secs,
            width: height.map(|h| h * 16 / 9),
            height,
            digest: String::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Which invocations a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTarget {
    /// Every invocation.
    Any,
    /// Invocations whose operation label matches ("trim", "composite", "transcode").
    Operation(&'static str),
    /// Transcodes to one resolution.
    Resolution(Resolution),
}

impl FailureTarget {
    fn matches(&self, operation: &EngineOperation) -> bool {
        match self {
            Self::Any => true,
            Self::Operation(label) => operation.label() == *label,
            Self::Resolution(wanted) => {
                matches!(operation, EngineOperation::Transcode { resolution } if resolution == wanted)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    Transient,
    Fatal,
    Panic,
}

#[derive(Debug)]
struct FailureRule {
    target: FailureTarget,
    mode: FailureMode,
    /// Remaining failures; `None` fails forever.
    remaining: Option<u32>,
}

/// Mock implementation of the TransformEngine trait.
///
/// Provides controllable behavior for testing:
/// - Deterministic outputs derived from input bytes and parameters
/// - Invocation and probe counters, recorded requests
/// - Scripted transient, fatal or panicking failures
/// - Artificial latency
///
/// # Example
///
/// ```rust,ignore
/// use vidpipe_core::testing::{FailureTarget, MockEngine};
///
/// let engine = MockEngine::new();
/// engine.fail_always(FailureTarget::Resolution(Resolution::R720p), false);
/// engine.fail_times(FailureTarget::Operation("trim"), 1, true);
/// ```
#[derive(Debug, Default)]
pub struct MockEngine {
    invocations: AtomicUsize,
    probes: AtomicUsize,
    requests: Mutex<Vec<EngineRequest>>,
    rules: Mutex<Vec<FailureRule>>,
    latency: Mutex<Duration>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every invocation by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Fail every matching invocation.
    pub fn fail_always(&self, target: FailureTarget, transient: bool) {
        self.add_rule(target, mode(transient), None);
    }

    /// Fail the next `times` matching invocations.
    pub fn fail_times(&self, target: FailureTarget, times: u32, transient: bool) {
        self.add_rule(target, mode(transient), Some(times));
    }

    /// Panic on every matching invocation.
    pub fn panic_on(&self, target: FailureTarget) {
        self.add_rule(target, FailureMode::Panic, None);
    }

    pub fn clear_failures(&self) {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn add_rule(&self, target: FailureTarget, mode: FailureMode, remaining: Option<u32>) {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FailureRule {
                target,
                mode,
                remaining,
            });
    }

    /// Total invocations, failed ones included.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Invocations whose operation label matches.
    pub fn invocations_of(&self, label: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.operation.label() == label)
            .count()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn scripted_failure(&self, operation: &EngineOperation) -> Option<FailureMode> {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        for rule in rules.iter_mut() {
            if !rule.target.matches(operation) {
                continue;
            }
            match rule.remaining.as_mut() {
                None => return Some(rule.mode),
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return Some(rule.mode);
                }
            }
        }
        None
    }

    async fn read_media(path: &Path) -> Result<(Vec<u8>, MockMedia), EngineError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::InputNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                EngineError::Io(e)
            }
        })?;
        let media = serde_json::from_slice(&bytes).map_err(|e| EngineError::CorruptInput {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Ok((bytes, media))
    }
}

fn mode(transient: bool) -> FailureMode {
    if transient {
        FailureMode::Transient
    } else {
        FailureMode::Fatal
    }
}

#[async_trait]
impl TransformEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn probe(&self, path: &Path) -> Result<MediaInfo, EngineError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let (bytes, media) = Self::read_media(path).await.map_err(|e| match e {
            EngineError::CorruptInput { reason } => EngineError::probe_failed(reason),
            other => other,
        })?;

        Ok(MediaInfo {
            path: path.to_path_buf(),
            size_bytes: bytes.len() as u64,
            duration_secs: media.duration_secs,
            format: "mock".to_string(),
            video_codec: Some("mock".to_string()),
            width: media.width,
            height: media.height,
            has_audio: true,
        })
    }

    async fn invoke(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError> {
        let started = Instant::now();
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.scripted_failure(&request.operation) {
            Some(FailureMode::Transient) => {
                // Leave a partial file behind, as a crashed encoder would.
                let _ = tokio::fs::write(&request.output_path, b"partial").await;
                return Err(EngineError::transient(format!(
                    "scripted transient failure ({})",
                    request.operation.label()
                )));
            }
            Some(FailureMode::Fatal) => {
                return Err(EngineError::fatal(
                    Some(1),
                    format!("scripted fatal failure ({})", request.operation.label()),
                ));
            }
            Some(FailureMode::Panic) => {
                panic!("scripted panic ({})", request.operation.label());
            }
            None => {}
        }

        let (input_bytes, input) = Self::read_media(&request.input_path).await?;

        let mut output = input.clone();
        match &request.operation {
            EngineOperation::Trim { start, end } => {
                output.duration_secs = (end.min(input.duration_secs) - start).max(0.0);
            }
            EngineOperation::Composite { .. } => {}
            EngineOperation::Transcode { resolution } => {
                let ladder = resolution.ladder();
                output.width = Some(ladder.width);
                output.height = Some(ladder.height);
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(&input_bytes);
        hasher.update(serde_json::to_vec(&request.operation).unwrap_or_default());
        output.digest = format!("{:x}", hasher.finalize());

        let bytes = output.to_bytes();
        tokio::fs::write(&request.output_path, &bytes).await?;

        Ok(EngineOutput {
            output_path: request.output_path.clone(),
            size_bytes: bytes.len() as u64,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn validate(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
