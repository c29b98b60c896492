//! Job execution: step planning, layer composition, fan-out and the executor.

mod compositor;
mod config;
mod executor;
mod fanout;
mod types;

pub use compositor::{describe, plan_steps, PlacedLayer, Step, StepKind, ENCODED_EXTENSION};
pub use config::{PipelineConfig, RetryConfig};
pub use executor::PipelineExecutor;
pub use fanout::{resolve_fanout, select_final};
pub use types::{PipelineError, Progress};
