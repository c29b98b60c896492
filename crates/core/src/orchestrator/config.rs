//! Orchestrator configuration.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::pipeline::PipelineConfig;

/// Sizing of the queue and pool plus the executor's settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum externally submitted units waiting in the queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_workers() -> usize {
    4
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue_capacity: config.queue.capacity,
            workers: config.workers.count,
            pipeline: config.pipeline.clone(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }
}
