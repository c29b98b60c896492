//! Bounded FIFO of executable work units.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::job::Resolution;
use crate::metrics;

/// One unit of executable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum WorkUnit {
    /// Run step `step` of a job.
    Step { job_id: String, step: usize },
    /// Run one resolution variant of a job's final transcode step.
    Variant {
        job_id: String,
        step: usize,
        resolution: Resolution,
    },
}

impl WorkUnit {
    pub fn step(job_id: impl Into<String>, step: usize) -> Self {
        Self::Step {
            job_id: job_id.into(),
            step,
        }
    }

    pub fn variant(job_id: impl Into<String>, step: usize, resolution: Resolution) -> Self {
        Self::Variant {
            job_id: job_id.into(),
            step,
            resolution,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Step { job_id, .. } | Self::Variant { job_id, .. } => job_id,
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step { job_id, step } => write!(f, "{}#step{}", job_id, step),
            Self::Variant {
                job_id,
                step,
                resolution,
            } => write!(f, "{}#step{}@{}", job_id, step, resolution),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Task queue is at capacity ({capacity})")]
    Backpressure { capacity: usize },

    #[error("Task queue is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    units: VecDeque<WorkUnit>,
    /// Slots handed out by `try_reserve` and not yet committed or dropped.
    reserved: usize,
    closed: bool,
}

/// Shared, bounded task queue.
///
/// External submissions go through [`TaskQueue::try_reserve`] and are rejected
/// with [`QueueError::Backpressure`] once queued plus reserved units reach the
/// capacity. Continuations produced by workers use [`TaskQueue::push_internal`]
/// and are never rejected, so a worker can always hand off a job's next unit.
#[derive(Debug)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every critical section leaves the state consistent, so a poisoned lock is safe to reuse.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Units currently waiting.
    pub fn len(&self) -> usize {
        self.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an identical unit is already waiting.
    pub fn contains(&self, unit: &WorkUnit) -> bool {
        self.lock().units.contains(unit)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Reserve room for one external unit.
    ///
    /// The reservation is released when the returned slot is dropped without
    /// being committed, which lets callers create durable records between the
    /// capacity check and the enqueue.
    pub fn try_reserve(self: &Arc<Self>) -> Result<QueueSlot, QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.units.len() + state.reserved >= self.capacity {
            return Err(QueueError::Backpressure {
                capacity: self.capacity,
            });
        }
        state.reserved += 1;
        Ok(QueueSlot {
            queue: Arc::clone(self),
            committed: false,
        })
    }

    /// Enqueue a continuation unit, bypassing the capacity bound.
    pub fn push_internal(&self, unit: WorkUnit) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.units.push_back(unit);
        metrics::QUEUE_DEPTH.set(state.units.len() as i64);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the oldest unit without waiting.
    pub fn try_pop(&self) -> Option<WorkUnit> {
        let mut state = self.lock();
        let unit = state.units.pop_front();
        if unit.is_some() {
            metrics::QUEUE_DEPTH.set(state.units.len() as i64);
        }
        unit
    }

    /// Wait for the next unit. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<WorkUnit> {
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(unit) = state.units.pop_front() {
                    metrics::QUEUE_DEPTH.set(state.units.len() as i64);
                    let more = !state.units.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(unit);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting units and wake every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn commit(&self, unit: WorkUnit) {
        let mut state = self.lock();
        state.reserved = state.reserved.saturating_sub(1);
        state.units.push_back(unit);
        metrics::QUEUE_DEPTH.set(state.units.len() as i64);
        drop(state);
        self.notify.notify_one();
    }

    fn release(&self) {
        let mut state = self.lock();
        state.reserved = state.reserved.saturating_sub(1);
    }
}

/// A reserved place in the queue for one external unit.
#[derive(Debug)]
pub struct QueueSlot {
    queue: Arc<TaskQueue>,
    committed: bool,
}

impl QueueSlot {
    /// Enqueue the unit into the reserved place.
    pub fn commit(mut self, unit: WorkUnit) {
        self.committed = true;
        self.queue.commit(unit);
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if !self.committed {
            self.queue.release();
        }
    }
}
