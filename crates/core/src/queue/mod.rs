//! Bounded task queue and the worker pool that drains it.

mod pool;
mod task_queue;

pub use pool::{PoolStatus, UnitHandler, WorkerPool};
pub use task_queue::{QueueError, QueueSlot, TaskQueue, WorkUnit};
