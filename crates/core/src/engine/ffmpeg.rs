//! FFmpeg-based engine implementation.

use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::config::EngineConfig;
use super::error::EngineError;
use super::traits::TransformEngine;
use super::types::{EngineOperation, EngineOutput, EngineRequest, Layer, MediaInfo};
use crate::job::{OverlayKind, OverlaySpec, Resolution, WatermarkSpec};

/// Maximum number of stderr error lines kept for failure messages.
const MAX_ERROR_LINES: usize = 20;

/// FFmpeg-based engine implementation.
pub struct FfmpegEngine {
    config: EngineConfig,
}

/// Escapes a value for use inside a single-quoted filtergraph option.
fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\'', "'\\''")
        .replace(':', "\\:")
}

fn fmt_secs(secs: f64) -> String {
    format!("{:.3}", secs)
}

/// Filter `enable` expression for a layer's time window.
fn enable_expr(start: f64, end: Option<f64>) -> String {
    match end {
        Some(end) => format!("between(t,{},{})", fmt_secs(start), fmt_secs(end)),
        None => format!("gte(t,{})", fmt_secs(start)),
    }
}

/// Path of the text file holding the content of layer `index`.
pub fn overlay_text_path(work_dir: &Path, output_path: &Path, index: usize) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    work_dir.join(format!("{}-text-{}.txt", stem, index))
}

impl FfmpegEngine {
    /// Creates a new FFmpeg engine with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Creates an engine with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-nostdin".to_string(),
            "-loglevel".to_string(),
            self.config.log_level.clone(),
            "-progress".to_string(),
            "pipe:2".to_string(),
        ]
    }

    fn finish_args(&self, args: &mut Vec<String>, output_path: &Path) {
        args.extend(self.config.extra_args.iter().cloned());
        args.push(output_path.to_string_lossy().to_string());
    }

    /// Builds ffmpeg arguments for a stream-copy trim.
    fn build_trim_args(&self, input: &Path, output: &Path, start: f64, end: f64) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-ss".to_string(),
            fmt_secs(start),
            "-to".to_string(),
            fmt_secs(end),
            "-c".to_string(),
            "copy".to_string(),
        ]);
        self.finish_args(&mut args, output);
        args
    }

    /// Builds the filtergraph for a composite operation.
    ///
    /// Layers are chained in order on top of `[0:v]`, so the last layer is
    /// topmost. Each image, video or watermark layer adds one extra input.
    fn build_filter_graph(&self, request: &EngineRequest, layers: &[Layer]) -> (Vec<String>, String, String) {
        let mut extra_inputs = Vec::new();
        let mut chains = Vec::new();
        let mut current = "0:v".to_string();

        for (index, layer) in layers.iter().enumerate() {
            let next = format!("v{}", index);
            match layer {
                Layer::Overlay(overlay) => {
                    let chain = self.overlay_chain(
                        request,
                        overlay,
                        index,
                        &current,
                        &next,
                        &mut extra_inputs,
                    );
                    chains.push(chain);
                }
                Layer::Watermark(watermark) => {
                    extra_inputs.push(watermark.image_ref.clone());
                    chains.push(Self::watermark_chain(
                        watermark,
                        extra_inputs.len(),
                        index,
                        &current,
                        &next,
                    ));
                }
            }
            current = next;
        }

        (extra_inputs, chains.join(";"), current)
    }

    fn overlay_chain(
        &self,
        request: &EngineRequest,
        overlay: &OverlaySpec,
        index: usize,
        current: &str,
        next: &str,
        extra_inputs: &mut Vec<String>,
    ) -> String {
        let enable = enable_expr(overlay.start_time, overlay.end_time);
        let (x, y) = (overlay.position.x, overlay.position.y);

        match overlay.kind {
            OverlayKind::Text => {
                let text_file = overlay_text_path(&request.work_dir, &request.output_path, index);
                let font = overlay
                    .style
                    .font_path
                    .as_deref()
                    .unwrap_or_else(|| self.config.font_for(overlay.language.as_deref()));
                format!(
                    "[{}]drawtext=textfile='{}':fontfile='{}':fontsize={}:fontcolor={}:x={}:y={}:enable='{}'[{}]",
                    current,
                    escape_filter_value(&text_file.to_string_lossy()),
                    escape_filter_value(&font.to_string_lossy()),
                    overlay.style.font_size,
                    overlay.style.font_color,
                    x,
                    y,
                    enable,
                    next
                )
            }
            OverlayKind::Image => {
                extra_inputs.push(overlay.content.clone());
                format!(
                    "[{}][{}:v]overlay={}:{}:enable='{}'[{}]",
                    current,
                    extra_inputs.len(),
                    x,
                    y,
                    enable,
                    next
                )
            }
            OverlayKind::Video => {
                extra_inputs.push(overlay.content.clone());
                // Shift the clip so its first frame lands on the window start.
                format!(
                    "[{input}:v]setpts=PTS-STARTPTS+{start}/TB[ov{index}];[{current}][ov{index}]overlay={x}:{y}:enable='{enable}'[{next}]",
                    input = extra_inputs.len(),
                    start = fmt_secs(overlay.start_time),
                    index = index,
                    current = current,
                    x = x,
                    y = y,
                    enable = enable,
                    next = next
                )
            }
        }
    }

    fn watermark_chain(
        watermark: &WatermarkSpec,
        input: usize,
        index: usize,
        current: &str,
        next: &str,
    ) -> String {
        format!(
            "[{input}:v]format=rgba,colorchannelmixer=aa={opacity}[wm{index}];[{current}][wm{index}]overlay={x}:{y}[{next}]",
            input = input,
            opacity = watermark.opacity,
            index = index,
            current = current,
            x = watermark.position.x,
            y = watermark.position.y,
            next = next
        )
    }

    /// Builds ffmpeg arguments for a composite operation.
    fn build_composite_args(&self, request: &EngineRequest, layers: &[Layer]) -> Vec<String> {
        let (extra_inputs, graph, last) = self.build_filter_graph(request, layers);

        let mut args = self.base_args();
        args.extend(["-i".to_string(), request.input_path.to_string_lossy().to_string()]);
        for input in extra_inputs {
            args.extend(["-i".to_string(), input]);
        }
        args.extend([
            "-filter_complex".to_string(),
            graph,
            "-map".to_string(),
            format!("[{}]", last),
            "-map".to_string(),
            "0:a?".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.config.preset.clone(),
            "-c:a".to_string(),
            "copy".to_string(),
        ]);
        self.finish_args(&mut args, &request.output_path);
        args
    }

    /// Builds ffmpeg arguments for one resolution tier.
    fn build_transcode_args(&self, input: &Path, output: &Path, resolution: Resolution) -> Vec<String> {
        let ladder = resolution.ladder();
        let mut args = self.base_args();
        args.extend([
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vf".to_string(),
            format!("scale={}:{}", ladder.width, ladder.height),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.config.preset.clone(),
            "-b:v".to_string(),
            format!("{}k", ladder.video_bitrate_kbps),
            "-crf".to_string(),
            ladder.crf.to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", self.config.audio_bitrate_kbps),
        ]);
        self.finish_args(&mut args, output);
        args
    }

    /// Writes the verbatim UTF-8 content of every text layer next to the output.
    async fn write_text_layers(&self, request: &EngineRequest, layers: &[Layer]) -> Result<(), EngineError> {
        for (index, layer) in layers.iter().enumerate() {
            if let Layer::Overlay(overlay) = layer {
                if overlay.kind == OverlayKind::Text {
                    tokio::fs::create_dir_all(&request.work_dir).await?;
                    let path = overlay_text_path(&request.work_dir, &request.output_path, index);
                    tokio::fs::write(&path, overlay.content.as_bytes()).await?;
                }
            }
        }
        Ok(())
    }

    fn build_args(&self, request: &EngineRequest) -> Vec<String> {
        match &request.operation {
            EngineOperation::Trim { start, end } => {
                self.build_trim_args(&request.input_path, &request.output_path, *start, *end)
            }
            EngineOperation::Composite { layers } => self.build_composite_args(request, layers),
            EngineOperation::Transcode { resolution } => {
                self.build_transcode_args(&request.input_path, &request.output_path, *resolution)
            }
        }
    }

    /// Maps a failed ffmpeg exit to an engine error.
    fn classify_failure(code: Option<i32>, error_output: &str) -> EngineError {
        let lower = error_output.to_ascii_lowercase();
        if lower.contains("invalid data found when processing input")
            || lower.contains("moov atom not found")
        {
            return EngineError::CorruptInput {
                reason: error_output.trim().to_string(),
            };
        }
        if lower.contains("unknown encoder")
            || lower.contains("decoder not found")
            || lower.contains("no such filter")
        {
            return EngineError::Unsupported {
                reason: error_output.trim().to_string(),
            };
        }

        let message = if error_output.trim().is_empty() {
            format!("FFmpeg exited with code: {:?}", code)
        } else {
            error_output.trim().to_string()
        };
        // No exit code means the process was killed by a signal.
        let transient = code.is_none() || lower.contains("resource temporarily unavailable");
        EngineError::Failed {
            code,
            message,
            transient,
        }
    }

    /// Parses ffprobe JSON output into MediaInfo.
    fn parse_probe_output(path: &Path, output: &str) -> Result<MediaInfo, EngineError> {
        #[derive(Deserialize)]
        struct ProbeOutput {
            format: ProbeFormat,
            #[serde(default)]
            streams: Vec<ProbeStream>,
        }

        #[derive(Deserialize)]
        struct ProbeFormat {
            format_name: String,
            duration: Option<String>,
            size: Option<String>,
        }

        #[derive(Deserialize)]
        struct ProbeStream {
            codec_type: String,
            codec_name: Option<String>,
            width: Option<u32>,
            height: Option<u32>,
        }

        let probe: ProbeOutput = serde_json::from_str(output)
            .map_err(|e| EngineError::probe_failed(format!("Failed to parse ffprobe output: {}", e)))?;

        let duration_secs = probe
            .format
            .duration
            .as_ref()
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| EngineError::probe_failed("ffprobe reported no duration"))?;

        let size_bytes = probe
            .format
            .size
            .as_ref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let video_stream = probe.streams.iter().find(|s| s.codec_type == "video");

        let format_name = probe
            .format
            .format_name
            .split(',')
            .next()
            .unwrap_or("unknown");

        Ok(MediaInfo {
            path: path.to_path_buf(),
            size_bytes,
            duration_secs,
            format: format_name.to_string(),
            video_codec: video_stream.and_then(|s| s.codec_name.clone()),
            width: video_stream.and_then(|s| s.width),
            height: video_stream.and_then(|s| s.height),
            has_audio: probe.streams.iter().any(|s| s.codec_type == "audio"),
        })
    }

    fn spawn_error(&self, e: std::io::Error, tool: &Path) -> EngineError {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::ToolNotFound {
                path: tool.to_path_buf(),
            }
        } else {
            EngineError::Io(e)
        }
    }
}

#[async_trait]
impl TransformEngine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn probe(&self, path: &Path) -> Result<MediaInfo, EngineError> {
        if !path.exists() {
            return Err(EngineError::InputNotFound {
                path: path.to_path_buf(),
            });
        }

        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| self.spawn_error(e, &self.config.ffprobe_path))?;

        if !output.status.success() {
            return Err(EngineError::probe_failed(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Self::parse_probe_output(path, &stdout)
    }

    async fn invoke(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError> {
        let start = Instant::now();

        if !request.input_path.exists() {
            return Err(EngineError::InputNotFound {
                path: request.input_path.clone(),
            });
        }
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let EngineOperation::Composite { layers } = &request.operation {
            self.write_text_layers(request, layers).await?;
        }

        let args = self.build_args(request);
        debug!(
            job_id = %request.job_id,
            operation = request.operation.label(),
            args = ?args,
            "Running ffmpeg"
        );

        // kill_on_drop stops the process when the caller's deadline drops this future.
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e, &self.config.ffmpeg_path))?;

        let mut error_lines: Vec<String> = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            let mut reader = BufReader::new(stderr).lines();
            let time_regex = Regex::new(r"out_time_ms=(\d+)").ok();
            let mut last_log = Instant::now();

            while let Ok(Some(line)) = reader.next_line().await {
                if line.to_ascii_lowercase().contains("error") || line.contains("Invalid") {
                    if error_lines.len() == MAX_ERROR_LINES {
                        error_lines.remove(0);
                    }
                    error_lines.push(line.clone());
                }

                if let Some(ref re) = time_regex {
                    if let Some(us) = re
                        .captures(&line)
                        .and_then(|caps| caps.get(1))
                        .and_then(|m| m.as_str().parse::<u64>().ok())
                    {
                        if last_log.elapsed().as_secs() >= 5 {
                            debug!(
                                job_id = %request.job_id,
                                position_secs = us as f64 / 1_000_000.0,
                                "ffmpeg progress"
                            );
                            last_log = Instant::now();
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(Self::classify_failure(status.code(), &error_lines.join("\n")));
        }

        let meta = tokio::fs::metadata(&request.output_path)
            .await
            .map_err(|_| EngineError::OutputMissing {
                path: request.output_path.clone(),
            })?;

        Ok(EngineOutput {
            output_path: request.output_path.clone(),
            size_bytes: meta.len(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn validate(&self) -> Result<(), EngineError> {
        for tool in [&self.config.ffmpeg_path, &self.config.ffprobe_path] {
            Command::new(tool)
                .arg("-version")
                .output()
                .await
                .map_err(|e| self.spawn_error(e, tool))?;
        }
        Ok(())
    }
}
