//! Job orchestrator: the facade callers use to register videos, submit and
//! cancel jobs, and run the worker pool.

mod config;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use runner::JobOrchestrator;
pub use types::{OrchestratorError, OrchestratorStatus, SubmitError};
