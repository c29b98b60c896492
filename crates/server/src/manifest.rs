//! Batch manifest read by the `vidpipe` binary.
//!
//! ```json
//! {
//!   "videos": [{ "name": "clip", "path": "clip.mp4" }],
//!   "jobs": [
//!     { "name": "short", "input": { "video": "clip" },
//!       "stages": [{ "stage": "trim", "start": 0, "end": 10 }] },
//!     { "name": "ladder", "input": { "job": "short" },
//!       "stages": [{ "stage": "transcode", "target_resolutions": ["720p", "480p"] }] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use vidpipe_core::{Resolution, StageSpec};

fn default_wait_timeout_secs() -> u64 {
    6 * 3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub videos: Vec<VideoEntry>,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
    /// How long to wait for each job to finish.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Append the Prometheus exposition text to the report.
    #[serde(default)]
    pub include_metrics: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoEntry {
    pub name: String,
    pub path: PathBuf,
}

/// Where a job reads its input, by manifest name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    Video(String),
    Job(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub name: String,
    pub input: InputRef,
    /// Output picked from a parent job; the best one when absent.
    #[serde(default)]
    pub resolution: Option<Resolution>,
    pub stages: Vec<StageSpec>,
}

impl Manifest {
    /// Read a manifest, resolving relative video paths against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        let mut manifest = Self::parse(&text)?;
        if let Some(base) = path.parent() {
            manifest.resolve_paths(base);
        }
        Ok(manifest)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(text).context("Invalid manifest")?;
        manifest.check_names()?;
        Ok(manifest)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for video in &mut self.videos {
            if video.path.is_relative() {
                video.path = base.join(&video.path);
            }
        }
    }

    /// Names must be unique and every reference must point backwards.
    fn check_names(&self) -> Result<()> {
        let mut videos = HashSet::new();
        for video in &self.videos {
            if !videos.insert(video.name.as_str()) {
                bail!("duplicate video name '{}'", video.name);
            }
        }

        let mut jobs = HashSet::new();
        for job in &self.jobs {
            match &job.input {
                InputRef::Video(name) if !videos.contains(name.as_str()) => {
                    bail!("job '{}' refers to unknown video '{}'", job.name, name);
                }
                InputRef::Job(name) if !jobs.contains(name.as_str()) => {
                    bail!(
                        "job '{}' refers to job '{}' which is not listed before it",
                        job.name,
                        name
                    );
                }
                _ => {}
            }
            if !jobs.insert(job.name.as_str()) {
                bail!("duplicate job name '{}'", job.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "videos": [{ "name": "clip", "path": "media/clip.mp4" }],
        "jobs": [
            {
                "name": "short",
                "input": { "video": "clip" },
                "stages": [
                    { "stage": "trim", "start": 0, "end": 10 },
                    { "stage": "overlay", "kind": "text", "content": "வணக்கம்",
                      "start_time": 1.0, "language": "ta" },
                    { "stage": "watermark", "image_ref": "logo.png", "opacity": 0.4 }
                ]
            },
            {
                "name": "ladder",
                "input": { "job": "short" },
                "resolution": "720p",
                "stages": [{ "stage": "transcode", "target_resolutions": ["720p", "480p"] }]
            }
        ]
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::parse(SAMPLE).unwrap();
        assert_eq!(manifest.videos.len(), 1);
        assert_eq!(manifest.jobs.len(), 2);
        assert_eq!(manifest.jobs[0].input, InputRef::Video("clip".to_string()));
        assert_eq!(manifest.jobs[0].stages.len(), 3);
        assert_eq!(manifest.jobs[1].resolution, Some(Resolution::R720p));
        assert_eq!(manifest.wait_timeout_secs, 6 * 3600);
        assert!(!manifest.include_metrics);

        match &manifest.jobs[0].stages[1] {
            StageSpec::Overlay(overlay) => {
                assert_eq!(overlay.content, "வணக்கம்");
                assert_eq!(overlay.end_time, None);
            }
            other => panic!("unexpected stage {:?}", other),
        }
    }

    #[test]
    fn test_unknown_video_rejected() {
        let text = r#"{ "jobs": [{ "name": "a", "input": { "video": "nope" },
            "stages": [{ "stage": "trim", "start": 0, "end": 1 }] }] }"#;
        let err = Manifest::parse(text).unwrap_err();
        assert!(err.to_string().contains("unknown video"));
    }

    #[test]
    fn test_forward_job_reference_rejected() {
        let text = r#"{
            "videos": [{ "name": "v", "path": "v.mp4" }],
            "jobs": [
                { "name": "a", "input": { "job": "b" },
                  "stages": [{ "stage": "trim", "start": 0, "end": 1 }] },
                { "name": "b", "input": { "video": "v" },
                  "stages": [{ "stage": "trim", "start": 0, "end": 1 }] }
            ]
        }"#;
        assert!(Manifest::parse(text).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let text = r#"{ "videos": [
            { "name": "v", "path": "a.mp4" },
            { "name": "v", "path": "b.mp4" }
        ] }"#;
        let err = Manifest::parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate video"));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.videos[0].path, dir.path().join("media/clip.mp4"));
    }
}
