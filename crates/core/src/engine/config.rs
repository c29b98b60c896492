//! Configuration for the engine module.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration for the FFmpeg-based engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to ffmpeg binary.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Path to ffprobe binary.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,

    /// FFmpeg log level (quiet, panic, fatal, error, warning, info, verbose, debug, trace).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// x264 preset used when re-encoding.
    #[serde(default = "default_preset")]
    pub preset: String,

    /// AAC bitrate for transcoded outputs.
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,

    /// Font file per language tag for text overlays.
    #[serde(default = "default_fonts")]
    pub fonts: BTreeMap<String, PathBuf>,

    /// Font used when a language has no entry in `fonts`.
    #[serde(default = "default_font")]
    pub default_font: PathBuf,

    /// Additional global ffmpeg arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_log_level() -> String {
    "warning".to_string()
}

fn default_preset() -> String {
    "fast".to_string()
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_font() -> PathBuf {
    PathBuf::from("assets/fonts/NotoSans-Regular.ttf")
}

fn default_fonts() -> BTreeMap<String, PathBuf> {
    [
        ("en", "assets/fonts/NotoSans-Regular.ttf"),
        ("hi", "assets/fonts/NotoSansDevanagari-Regular.ttf"),
        ("ta", "assets/fonts/NotoSansTamil-Regular.ttf"),
        ("te", "assets/fonts/NotoSansTelugu-Regular.ttf"),
    ]
    .into_iter()
    .map(|(lang, path)| (lang.to_string(), PathBuf::from(path)))
    .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            log_level: default_log_level(),
            preset: default_preset(),
            audio_bitrate_kbps: default_audio_bitrate(),
            fonts: default_fonts(),
            default_font: default_font(),
            extra_args: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a new config with custom ffmpeg/ffprobe paths.
    pub fn with_paths(ffmpeg_path: PathBuf, ffprobe_path: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            ffprobe_path,
            ..Default::default()
        }
    }

    /// Registers a font for a language tag.
    pub fn with_font(mut self, language: impl Into<String>, path: PathBuf) -> Self {
        self.fonts.insert(language.into(), path);
        self
    }

    /// Font for a language tag such as `hi` or `ta-IN`, falling back to the default font.
    pub fn font_for(&self, language: Option<&str>) -> &Path {
        language
            .map(|lang| lang.to_ascii_lowercase())
            .and_then(|lang| {
                let primary = lang.split(['-', '_']).next().unwrap_or_default().to_string();
                self.fonts.get(&lang).or_else(|| self.fonts.get(&primary))
            })
            .map(PathBuf::as_path)
            .unwrap_or(&self.default_font)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.ffprobe_path, PathBuf::from("ffprobe"));
        assert_eq!(config.preset, "fast");
        assert_eq!(config.audio_bitrate_kbps, 128);
        assert_eq!(config.fonts.len(), 4);
    }

    #[test]
    fn test_font_lookup() {
        let config = EngineConfig::default();
        assert_eq!(
            config.font_for(Some("hi")),
            Path::new("assets/fonts/NotoSansDevanagari-Regular.ttf")
        );
        assert_eq!(
            config.font_for(Some("ta-IN")),
            Path::new("assets/fonts/NotoSansTamil-Regular.ttf")
        );
        assert_eq!(
            config.font_for(Some("TE")),
            Path::new("assets/fonts/NotoSansTelugu-Regular.ttf")
        );
        assert_eq!(config.font_for(Some("fr")), config.default_font.as_path());
        assert_eq!(config.font_for(None), config.default_font.as_path());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::with_paths(
            PathBuf::from("/usr/local/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffprobe"),
        )
        .with_font("bn", PathBuf::from("/fonts/NotoSansBengali.ttf"));

        assert_eq!(config.ffmpeg_path, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(
            config.font_for(Some("bn")),
            Path::new("/fonts/NotoSansBengali.ttf")
        );
    }
}
