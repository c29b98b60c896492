//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Submissions (accepted, rejected by reason)
//! - Task queue depth and worker utilisation
//! - Engine invocations, retries and step durations
//! - Terminal job outcomes

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Global metrics registry holding every core metric.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    for metric in all_metrics() {
        // Only fails on duplicate registration, which all_metrics() never produces.
        let _ = registry.register(metric);
    }
    registry
});

// =============================================================================
// Submission Metrics
// =============================================================================

/// Submissions accepted into the queue.
pub static SUBMISSIONS_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "vidpipe_submissions_accepted_total",
        "Total job submissions accepted",
    )
    .unwrap()
});

/// Submissions rejected by reason.
pub static SUBMISSIONS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vidpipe_submissions_rejected_total",
            "Total job submissions rejected",
        ),
        &["reason"], // "backpressure", "validation", "not_found", "shutting_down", "store"
    )
    .unwrap()
});

// =============================================================================
// Queue & Worker Metrics
// =============================================================================

/// Work units waiting in the task queue.
pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("vidpipe_queue_depth", "Work units waiting in the task queue").unwrap()
});

/// Workers currently executing a unit.
pub static BUSY_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("vidpipe_busy_workers", "Workers currently executing a unit").unwrap()
});

/// Units whose execution panicked.
pub static UNIT_PANICS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("vidpipe_unit_panics_total", "Work units that panicked").unwrap()
});

// =============================================================================
// Engine & Step Metrics
// =============================================================================

/// Engine invocation attempts by operation and outcome.
pub static ENGINE_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vidpipe_engine_attempts_total",
            "Engine invocation attempts",
        ),
        &["operation", "outcome"], // outcome: "success", "transient", "fatal"
    )
    .unwrap()
});

/// Retries after transient engine failures.
pub static ENGINE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vidpipe_engine_retries_total",
            "Retries after transient engine failures",
        ),
        &["operation"],
    )
    .unwrap()
});

/// Wall-clock duration of a step or variant including retries.
pub static STEP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "vidpipe_step_duration_seconds",
            "Duration of a pipeline step or variant",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["operation"],
    )
    .unwrap()
});

/// Jobs reaching a terminal state.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("vidpipe_jobs_finished_total", "Jobs reaching a terminal state"),
        &["status"], // "succeeded", "failed", "canceled"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Submissions
        Box::new(SUBMISSIONS_ACCEPTED.clone()),
        Box::new(SUBMISSIONS_REJECTED.clone()),
        // Queue & workers
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(BUSY_WORKERS.clone()),
        Box::new(UNIT_PANICS.clone()),
        // Engine & steps
        Box::new(ENGINE_ATTEMPTS.clone()),
        Box::new(ENGINE_RETRIES.clone()),
        Box::new(STEP_DURATION.clone()),
        Box::new(JOBS_FINISHED.clone()),
    ]
}

/// Encode all registered metrics in the Prometheus text format.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register_once() {
        let registry = Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
        SUBMISSIONS_REJECTED.with_label_values(&["backpressure"]).inc();
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn test_render_metrics_contains_names() {
        JOBS_FINISHED.with_label_values(&["succeeded"]).inc();
        let text = render_metrics();
        assert!(text.contains("vidpipe_jobs_finished_total"));
    }
}
