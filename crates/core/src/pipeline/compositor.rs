//! Turns a job's stage list into executable steps.
//!
//! A trim is one step, a transcode is one step, and every maximal run of
//! consecutive overlay/watermark stages collapses into a single composite
//! step. Inside a composite the base stream is drawn first, then overlays in
//! the order they were listed, then the watermark on top.

use std::path::Path;

use crate::engine::{EngineOperation, Layer};
use crate::job::{
    InputProfile, Resolution, StageSpec, TranscodeSpec, TrimSpec, ValidationError,
};

/// Extension used for re-encoded outputs.
pub const ENCODED_EXTENSION: &str = "mp4";

/// A layer together with the index of the stage that requested it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedLayer {
    pub stage_index: usize,
    pub layer: Layer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Trim(TrimSpec),
    Composite(Vec<PlacedLayer>),
    Transcode(TranscodeSpec),
}

/// One unit of sequential work in a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub index: usize,
    /// Stage indices covered by this step, in listed order.
    pub stage_indices: Vec<usize>,
    pub kind: StepKind,
}

impl Step {
    pub fn first_stage(&self) -> usize {
        self.stage_indices.first().copied().unwrap_or(0)
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            StepKind::Trim(_) => "trim",
            StepKind::Composite(_) => "composite",
            StepKind::Transcode(_) => "transcode",
        }
    }

    pub fn is_transcode(&self) -> bool {
        matches!(self.kind, StepKind::Transcode(_))
    }

    /// Requested tiers when this is a transcode step, highest first.
    pub fn resolutions(&self) -> Vec<Resolution> {
        match &self.kind {
            StepKind::Transcode(spec) => spec.target_resolutions.iter().rev().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// The engine operation for a non-transcode step.
    pub fn operation(&self) -> Option<EngineOperation> {
        match &self.kind {
            StepKind::Trim(trim) => Some(EngineOperation::Trim {
                start: trim.start,
                end: trim.end,
            }),
            StepKind::Composite(layers) => Some(EngineOperation::Composite {
                layers: layers.iter().map(|l| l.layer.clone()).collect(),
            }),
            StepKind::Transcode(_) => None,
        }
    }

    /// Re-check every stage of this step against the input it will actually read.
    pub fn validate(&self, stages: &[StageSpec], input: &InputProfile) -> Result<(), ValidationError> {
        for &index in &self.stage_indices {
            if let Some(stage) = stages.get(index) {
                stage
                    .validate(Some(input))
                    .map_err(|e| ValidationError::new(index, e))?;
            }
        }
        Ok(())
    }

    /// File extension for this step's output.
    ///
    /// Trims copy streams and keep the input's container; everything else is
    /// re-encoded to MP4.
    pub fn output_extension(&self, input: &Path) -> String {
        match self.kind {
            StepKind::Trim(_) => input
                .extension()
                .and_then(|e| e.to_str())
                .filter(|e| !e.is_empty())
                .unwrap_or(ENCODED_EXTENSION)
                .to_string(),
            _ => ENCODED_EXTENSION.to_string(),
        }
    }
}

/// Plan the steps for a stage list.
///
/// Assumes the list already passed structural validation.
pub fn plan_steps(stages: &[StageSpec]) -> Vec<Step> {
    let mut steps: Vec<Step> = Vec::new();
    let mut run: Vec<usize> = Vec::new();

    for (index, stage) in stages.iter().enumerate() {
        if stage.is_layer() {
            run.push(index);
            continue;
        }
        if !run.is_empty() {
            let composite = composite_step(steps.len(), stages, std::mem::take(&mut run));
            steps.push(composite);
        }
        let kind = match stage {
            StageSpec::Trim(trim) => StepKind::Trim(trim.clone()),
            StageSpec::Transcode(spec) => StepKind::Transcode(spec.clone()),
            StageSpec::Overlay(_) | StageSpec::Watermark(_) => continue,
        };
        steps.push(Step {
            index: steps.len(),
            stage_indices: vec![index],
            kind,
        });
    }

    if !run.is_empty() {
        steps.push(composite_step(steps.len(), stages, run));
    }

    steps
}

fn composite_step(step_index: usize, stages: &[StageSpec], run: Vec<usize>) -> Step {
    let mut overlays = Vec::new();
    let mut watermarks = Vec::new();
    for &index in &run {
        match &stages[index] {
            StageSpec::Overlay(spec) => overlays.push(PlacedLayer {
                stage_index: index,
                layer: Layer::Overlay(spec.clone()),
            }),
            StageSpec::Watermark(spec) => watermarks.push(PlacedLayer {
                stage_index: index,
                layer: Layer::Watermark(spec.clone()),
            }),
            _ => {}
        }
    }
    // Watermark is always topmost.
    overlays.extend(watermarks);

    Step {
        index: step_index,
        stage_indices: run,
        kind: StepKind::Composite(overlays),
    }
}

/// Stage kinds present in a plan, for logging.
pub fn describe(stages: &[StageSpec]) -> String {
    stages
        .iter()
        .map(|s| s.kind().as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{OverlaySpec, WatermarkSpec};

    fn overlay(text: &str) -> StageSpec {
        StageSpec::Overlay(OverlaySpec::text(text, 0.0, Some(1.0)))
    }

    fn watermark() -> StageSpec {
        StageSpec::Watermark(WatermarkSpec::new("/logo.png"))
    }

    #[test]
    fn test_single_trim() {
        let steps = plan_steps(&[StageSpec::trim(1.0, 4.0)]);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].label(), "trim");
        assert_eq!(
            steps[0].operation(),
            Some(EngineOperation::Trim { start: 1.0, end: 4.0 })
        );
    }

    #[test]
    fn test_full_pipeline_plan() {
        let stages = vec![
            StageSpec::trim(0.0, 10.0),
            watermark(),
            overlay("first"),
            overlay("second"),
            StageSpec::transcode([Resolution::R480p, Resolution::R1080p]),
        ];
        let steps = plan_steps(&stages);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].stage_indices, vec![1, 2, 3]);
        assert_eq!(steps[2].index, 2);
        assert!(steps[2].is_transcode());
        assert_eq!(
            steps[2].resolutions(),
            vec![Resolution::R1080p, Resolution::R480p]
        );
        assert!(steps[2].operation().is_none());
    }

    #[test]
    fn test_composite_order_keeps_overlays_and_puts_watermark_last() {
        let stages = vec![watermark(), overlay("a"), overlay("b")];
        let steps = plan_steps(&stages);
        assert_eq!(steps.len(), 1);

        let StepKind::Composite(layers) = &steps[0].kind else {
            panic!("expected composite");
        };
        let order: Vec<usize> = layers.iter().map(|l| l.stage_index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(matches!(layers[2].layer, Layer::Watermark(_)));
        match &layers[0].layer {
            Layer::Overlay(o) => assert_eq!(o.content, "a"),
            other => panic!("unexpected layer {:?}", other),
        }
    }

    #[test]
    fn test_layer_runs_split_by_trim() {
        let stages = vec![overlay("a"), StageSpec::trim(0.0, 5.0), overlay("b")];
        let steps = plan_steps(&stages);
        let labels: Vec<&str> = steps.iter().map(|s| s.label()).collect();
        assert_eq!(labels, vec!["composite", "trim", "composite"]);
        assert_eq!(steps[2].first_stage(), 2);
    }

    #[test]
    fn test_step_validation_reports_stage_index() {
        let stages = vec![overlay("a"), StageSpec::Overlay(OverlaySpec::text("late", 40.0, None))];
        let steps = plan_steps(&stages);
        let err = steps[0]
            .validate(&stages, &InputProfile::new(30.0, None))
            .unwrap_err();
        assert_eq!(err.stage_index, 1);
    }

    #[test]
    fn test_output_extension() {
        let trim = &plan_steps(&[StageSpec::trim(0.0, 1.0)])[0];
        assert_eq!(trim.output_extension(Path::new("/v/source.mkv")), "mkv");
        assert_eq!(trim.output_extension(Path::new("/v/source")), "mp4");

        let composite = &plan_steps(&[watermark()])[0];
        assert_eq!(composite.output_extension(Path::new("/v/source.mkv")), "mp4");
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&[StageSpec::trim(0.0, 1.0), watermark()]),
            "trim -> watermark"
        );
        assert_eq!(
            describe(&[
                StageSpec::trim(0.0, 1.0),
                StageSpec::Overlay(OverlaySpec::text("hi", 0.0, None)),
                StageSpec::transcode([Resolution::R480p]),
            ]),
            "trim -> overlay -> transcode"
        );
        assert_eq!(describe(&[]), "");
    }
}
