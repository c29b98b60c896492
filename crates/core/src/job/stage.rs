//! Stage specifications and their validation rules.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance applied when comparing a window end against the input duration.
pub const DURATION_TOLERANCE_SECS: f64 = 0.001;

// ============================================================================
// Resolution tiers
// ============================================================================

/// Supported output resolution tiers, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "480p")]
    R480p,
    #[serde(rename = "720p")]
    R720p,
    #[serde(rename = "1080p")]
    R1080p,
}

/// Encoding parameters for one resolution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingLadder {
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub crf: u8,
}

impl Resolution {
    /// All tiers, highest first.
    pub const ALL: [Resolution; 3] = [Resolution::R1080p, Resolution::R720p, Resolution::R480p];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::R480p => "480p",
            Resolution::R720p => "720p",
            Resolution::R1080p => "1080p",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "480p" => Some(Resolution::R480p),
            "720p" => Some(Resolution::R720p),
            "1080p" => Some(Resolution::R1080p),
            _ => None,
        }
    }

    /// Frame size, bitrate and quality settings for this tier.
    pub fn ladder(&self) -> EncodingLadder {
        match self {
            Resolution::R1080p => EncodingLadder {
                width: 1920,
                height: 1080,
                video_bitrate_kbps: 5000,
                crf: 23,
            },
            Resolution::R720p => EncodingLadder {
                width: 1280,
                height: 720,
                video_bitrate_kbps: 2500,
                crf: 25,
            },
            Resolution::R480p => EncodingLadder {
                width: 854,
                height: 480,
                video_bitrate_kbps: 1000,
                crf: 28,
            },
        }
    }

    pub fn height(&self) -> u32 {
        self.ladder().height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stage specifications
// ============================================================================

/// Pixel offset of a layer from the top-left corner of the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
}

impl Position {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    Text,
    Image,
    Video,
}

/// Font settings for text overlays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStyle {
    /// Explicit font file. When absent the engine picks one from the language tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_font_color")]
    pub font_color: String,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_path: None,
            font_size: default_font_size(),
            font_color: default_font_color(),
        }
    }
}

fn default_font_size() -> u32 {
    30
}

fn default_font_color() -> String {
    "white".to_string()
}

fn default_text_encoding() -> String {
    "utf-8".to_string()
}

fn default_opacity() -> f32 {
    0.5
}

/// Cut the input to `[start, end)` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimSpec {
    pub start: f64,
    pub end: f64,
}

/// A text, image or video layer shown during a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlaySpec {
    pub kind: OverlayKind,
    /// Literal text for text overlays, a file path for image and video overlays.
    pub content: String,
    #[serde(default)]
    pub position: Position,
    pub start_time: f64,
    /// `None` keeps the overlay until the end of the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default = "default_text_encoding")]
    pub text_encoding: String,
    /// Language or script tag of text content (`en`, `hi`, `ta`, `te`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub style: TextStyle,
}

impl OverlaySpec {
    pub fn text(content: impl Into<String>, start_time: f64, end_time: Option<f64>) -> Self {
        Self {
            kind: OverlayKind::Text,
            content: content.into(),
            position: Position::default(),
            start_time,
            end_time,
            text_encoding: default_text_encoding(),
            language: None,
            style: TextStyle::default(),
        }
    }

    pub fn image(path: impl Into<String>, start_time: f64, end_time: Option<f64>) -> Self {
        Self {
            kind: OverlayKind::Image,
            ..Self::text(path, start_time, end_time)
        }
    }

    pub fn video(path: impl Into<String>, start_time: f64, end_time: Option<f64>) -> Self {
        Self {
            kind: OverlayKind::Video,
            ..Self::text(path, start_time, end_time)
        }
    }

    pub fn with_position(mut self, x: u32, y: u32) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_style(mut self, style: TextStyle) -> Self {
        self.style = style;
        self
    }
}

/// Semi-transparent image composited on top of every other layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkSpec {
    pub image_ref: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
}

impl WatermarkSpec {
    pub fn new(image_ref: impl Into<String>) -> Self {
        Self {
            image_ref: image_ref.into(),
            position: Position::default(),
            opacity: default_opacity(),
        }
    }

    pub fn with_position(mut self, x: u32, y: u32) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }
}

/// Re-encode the input once per requested resolution tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSpec {
    pub target_resolutions: BTreeSet<Resolution>,
}

impl TranscodeSpec {
    pub fn new(resolutions: impl IntoIterator<Item = Resolution>) -> Self {
        Self {
            target_resolutions: resolutions.into_iter().collect(),
        }
    }
}

/// One requested transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageSpec {
    Trim(TrimSpec),
    Overlay(OverlaySpec),
    Watermark(WatermarkSpec),
    Transcode(TranscodeSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Trim,
    Overlay,
    Watermark,
    Transcode,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Trim => "trim",
            StageKind::Overlay => "overlay",
            StageKind::Watermark => "watermark",
            StageKind::Transcode => "transcode",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StageSpec {
    pub fn trim(start: f64, end: f64) -> Self {
        StageSpec::Trim(TrimSpec { start, end })
    }

    pub fn transcode(resolutions: impl IntoIterator<Item = Resolution>) -> Self {
        StageSpec::Transcode(TranscodeSpec::new(resolutions))
    }

    pub fn kind(&self) -> StageKind {
        match self {
            StageSpec::Trim(_) => StageKind::Trim,
            StageSpec::Overlay(_) => StageKind::Overlay,
            StageSpec::Watermark(_) => StageKind::Watermark,
            StageSpec::Transcode(_) => StageKind::Transcode,
        }
    }

    /// Whether this stage is drawn by the compositor.
    pub fn is_layer(&self) -> bool {
        matches!(self, StageSpec::Overlay(_) | StageSpec::Watermark(_))
    }
}

// ============================================================================
// Validation
// ============================================================================

/// What is known about a stage's input when validating against it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputProfile {
    pub duration_secs: f64,
    pub height: Option<u32>,
}

impl InputProfile {
    pub fn new(duration_secs: f64, height: Option<u32>) -> Self {
        Self {
            duration_secs,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageValidationError {
    #[error("stage list is empty")]
    EmptyPipeline,

    #[error("time values must be finite and non-negative")]
    InvalidTime,

    #[error("trim start ({start}s) must be before end ({end}s)")]
    InvalidTrimBounds { start: f64, end: f64 },

    #[error("trim end ({end}s) exceeds input duration ({duration}s)")]
    TrimBeyondInput { end: f64, duration: f64 },

    #[error("window start ({start}s) must be before end ({end}s)")]
    EmptyWindow { start: f64, end: f64 },

    #[error("window [{start}s, {end}s) lies outside input duration ({duration}s)")]
    WindowOutsideDuration { start: f64, end: f64, duration: f64 },

    #[error("overlay content is empty")]
    EmptyContent,

    #[error("unsupported text encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("opacity {0} must be between 0 and 1")]
    InvalidOpacity(f32),

    #[error("font size must be positive")]
    InvalidFontSize,

    #[error("transcode requires at least one target resolution")]
    NoTargetResolutions,

    #[error("cannot upscale {input_height}p input to {resolution}")]
    UpscaleNotSupported {
        resolution: Resolution,
        input_height: u32,
    },

    #[error("transcode must be the last stage")]
    TranscodeNotLast,

    #[error("only one watermark is allowed per composite step")]
    MultipleWatermarks,
}

/// A stage rejected by validation, with its position in the stage list.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("stage {stage_index}: {source}")]
pub struct ValidationError {
    pub stage_index: usize,
    #[source]
    pub source: StageValidationError,
}

impl ValidationError {
    pub fn new(stage_index: usize, source: StageValidationError) -> Self {
        Self {
            stage_index,
            source,
        }
    }
}

fn check_time(t: f64) -> Result<(), StageValidationError> {
    if !t.is_finite() || t < 0.0 {
        return Err(StageValidationError::InvalidTime);
    }
    Ok(())
}

impl TrimSpec {
    pub fn validate(&self, input: Option<&InputProfile>) -> Result<(), StageValidationError> {
        check_time(self.start)?;
        check_time(self.end)?;
        if self.start >= self.end {
            return Err(StageValidationError::InvalidTrimBounds {
                start: self.start,
                end: self.end,
            });
        }
        if let Some(input) = input {
            if self.end > input.duration_secs + DURATION_TOLERANCE_SECS {
                return Err(StageValidationError::TrimBeyondInput {
                    end: self.end,
                    duration: input.duration_secs,
                });
            }
        }
        Ok(())
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

impl OverlaySpec {
    /// Effective end of the window for an input of the given duration.
    pub fn window_end(&self, duration_secs: f64) -> f64 {
        self.end_time.unwrap_or(duration_secs)
    }

    pub fn validate(&self, input: Option<&InputProfile>) -> Result<(), StageValidationError> {
        check_time(self.start_time)?;
        if let Some(end) = self.end_time {
            check_time(end)?;
            if self.start_time >= end {
                return Err(StageValidationError::EmptyWindow {
                    start: self.start_time,
                    end,
                });
            }
        }
        if self.content.trim().is_empty() {
            return Err(StageValidationError::EmptyContent);
        }
        if self.kind == OverlayKind::Text {
            let encoding = self.text_encoding.to_ascii_lowercase();
            if encoding != "utf-8" && encoding != "utf8" {
                return Err(StageValidationError::UnsupportedEncoding(
                    self.text_encoding.clone(),
                ));
            }
            if self.style.font_size == 0 {
                return Err(StageValidationError::InvalidFontSize);
            }
        }
        if let Some(input) = input {
            let duration = input.duration_secs;
            let end = self.window_end(duration);
            if self.start_time >= duration || end > duration + DURATION_TOLERANCE_SECS {
                return Err(StageValidationError::WindowOutsideDuration {
                    start: self.start_time,
                    end,
                    duration,
                });
            }
        }
        Ok(())
    }
}

impl WatermarkSpec {
    pub fn validate(&self) -> Result<(), StageValidationError> {
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(StageValidationError::InvalidOpacity(self.opacity));
        }
        if self.image_ref.trim().is_empty() {
            return Err(StageValidationError::EmptyContent);
        }
        Ok(())
    }
}

impl TranscodeSpec {
    pub fn validate(&self, input: Option<&InputProfile>) -> Result<(), StageValidationError> {
        if self.target_resolutions.is_empty() {
            return Err(StageValidationError::NoTargetResolutions);
        }
        if let Some(input_height) = input.and_then(|i| i.height) {
            if let Some(resolution) = self
                .target_resolutions
                .iter()
                .rev()
                .find(|r| r.height() > input_height)
            {
                return Err(StageValidationError::UpscaleNotSupported {
                    resolution: *resolution,
                    input_height,
                });
            }
        }
        Ok(())
    }
}

impl StageSpec {
    /// Validate this stage alone, optionally against its input.
    pub fn validate(&self, input: Option<&InputProfile>) -> Result<(), StageValidationError> {
        match self {
            StageSpec::Trim(spec) => spec.validate(input),
            StageSpec::Overlay(spec) => spec.validate(input),
            StageSpec::Watermark(spec) => spec.validate(),
            StageSpec::Transcode(spec) => spec.validate(input),
        }
    }
}

/// Validate a whole stage list.
///
/// Checks structure (non-empty, transcode last, one watermark per contiguous
/// layer run) and every stage's own rules. With a source profile, windows and
/// resolutions are also checked against the duration each stage will see,
/// following trims along the way.
pub fn validate_stages(
    stages: &[StageSpec],
    source: Option<&InputProfile>,
) -> Result<(), ValidationError> {
    if stages.is_empty() {
        return Err(ValidationError::new(0, StageValidationError::EmptyPipeline));
    }

    let mut profile = source.copied();
    let mut watermark_in_run = false;

    for (index, stage) in stages.iter().enumerate() {
        if !stage.is_layer() {
            watermark_in_run = false;
        }
        match stage {
            StageSpec::Transcode(_) if index + 1 != stages.len() => {
                return Err(ValidationError::new(
                    index,
                    StageValidationError::TranscodeNotLast,
                ));
            }
            StageSpec::Watermark(_) => {
                if watermark_in_run {
                    return Err(ValidationError::new(
                        index,
                        StageValidationError::MultipleWatermarks,
                    ));
                }
                watermark_in_run = true;
            }
            _ => {}
        }

        stage
            .validate(profile.as_ref())
            .map_err(|e| ValidationError::new(index, e))?;

        if let (StageSpec::Trim(trim), Some(p)) = (stage, profile.as_mut()) {
            p.duration_secs = trim.duration();
        }
    }

    Ok(())
}
