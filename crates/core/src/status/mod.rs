//! Status and result queries.

mod service;
mod types;

pub use service::StatusService;
pub use types::{JobStatusView, ResultRef, StatusError, VideoStats};
