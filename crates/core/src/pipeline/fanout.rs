//! Fan-out bookkeeping for multi-resolution transcodes.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::job::{Artifact, ArtifactKind, FanoutTally, JobStatus, Resolution};

/// Terminal status implied by a fully accounted fan-out, if any.
///
/// Any failed variant fails the job. Otherwise skipped variants (the job was
/// canceled mid fan-out) cancel it. Succeeded variants stay registered either way.
pub fn resolve_fanout(tally: &FanoutTally) -> Option<JobStatus> {
    if !tally.is_complete() {
        return None;
    }
    if tally.failed > 0 {
        Some(JobStatus::Failed)
    } else if tally.skipped > 0 {
        Some(JobStatus::Canceled)
    } else {
        Some(JobStatus::Succeeded)
    }
}

/// Pick a job's final artifact.
///
/// With a resolution, only that tier matches. Without one, the highest tier
/// wins, and an untiered output (single-output jobs) is used when no tier exists.
pub fn select_final(artifacts: &[Artifact], resolution: Option<Resolution>) -> Option<&Artifact> {
    let finals = artifacts.iter().filter(|a| a.kind == ArtifactKind::Final);
    match resolution {
        Some(wanted) => finals.filter(|a| a.resolution == Some(wanted)).last(),
        None => finals.max_by_key(|a| a.resolution),
    }
}

/// Messages of failed variants, kept until the job finalizes.
#[derive(Debug, Default)]
pub struct VariantErrors {
    inner: Mutex<HashMap<String, Vec<(Resolution, String)>>>,
}

impl VariantErrors {
    pub fn record(&self, job_id: &str, resolution: Resolution, message: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(job_id.to_string())
            .or_default()
            .push((resolution, message));
    }

    /// Remove and summarize the job's failures, highest tier first.
    pub fn take_summary(&self, job_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut errors = inner.remove(job_id)?;
        errors.sort_by(|a, b| b.0.cmp(&a.0));
        Some(
            errors
                .into_iter()
                .map(|(_, message)| message)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}
