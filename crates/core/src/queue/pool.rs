//! Fixed-size pool of workers draining the task queue.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::task_queue::{TaskQueue, WorkUnit};
use crate::metrics;

/// Executes dequeued work units.
#[async_trait]
pub trait UnitHandler: Send + Sync {
    /// Run one unit to completion. Failures are recorded by the handler itself.
    async fn handle(&self, unit: WorkUnit);

    /// Called when `handle` panicked for `unit`.
    async fn handle_panic(&self, unit: WorkUnit, message: String);
}

#[derive(Default)]
struct PoolStats {
    busy: AtomicU64,
    processed: AtomicU64,
    panicked: AtomicU64,
}

/// Snapshot of the pool's state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    pub running: bool,
    pub workers: usize,
    /// Workers currently executing a unit.
    pub busy: u64,
    pub processed: u64,
    pub panicked: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

/// Worker pool.
///
/// Each worker takes one unit at a time and runs it in its own task so a
/// panic is contained to that unit. Any continuation is enqueued by the
/// handler before the worker takes its next unit.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    handler: Arc<dyn UnitHandler>,
    worker_count: usize,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(queue: Arc<TaskQueue>, handler: Arc<dyn UnitHandler>, worker_count: usize) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            handler,
            worker_count: worker_count.max(1),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the workers.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already running");
            return;
        }

        info!(workers = self.worker_count, "Starting worker pool");

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for worker_id in 0..self.worker_count {
            handles.push(self.spawn_worker(worker_id));
        }
    }

    /// Signal shutdown and wait for every worker to finish its current unit.
    ///
    /// Units still queued stay in the queue.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Worker pool not running");
            return;
        }

        info!("Stopping worker pool");
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        info!("Worker pool stopped");
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            running: self.is_running(),
            workers: self.worker_count,
            busy: self.stats.busy.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            panicked: self.stats.panicked.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
        }
    }

    fn spawn_worker(&self, worker_id: usize) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!(worker_id, "Worker started");
            loop {
                let unit = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    unit = queue.pop() => match unit {
                        Some(unit) => unit,
                        None => break,
                    },
                };

                stats.busy.fetch_add(1, Ordering::Relaxed);
                metrics::BUSY_WORKERS.inc();
                debug!(worker_id, unit = %unit, "Worker picked up unit");

                let task = {
                    let handler = Arc::clone(&handler);
                    let unit = unit.clone();
                    tokio::spawn(async move { handler.handle(unit).await })
                };

                if let Err(e) = task.await {
                    if e.is_panic() {
                        let message = panic_message(e.into_panic());
                        error!(worker_id, unit = %unit, panic = %message, "Work unit panicked");
                        stats.panicked.fetch_add(1, Ordering::Relaxed);
                        metrics::UNIT_PANICS.inc();
                        handler.handle_panic(unit, message).await;
                    } else {
                        warn!(worker_id, unit = %unit, "Work unit task was cancelled");
                    }
                }

                stats.processed.fetch_add(1, Ordering::Relaxed);
                stats.busy.fetch_sub(1, Ordering::Relaxed);
                metrics::BUSY_WORKERS.dec();
            }
            debug!(worker_id, "Worker stopped");
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingHandler {
        handled: AsyncMutex<Vec<WorkUnit>>,
        panics: AsyncMutex<Vec<(WorkUnit, String)>>,
        in_flight: AtomicU64,
        max_in_flight: AtomicU64,
    }

    #[async_trait]
    impl UnitHandler for RecordingHandler {
        async fn handle(&self, unit: WorkUnit) {
            if unit.job_id() == "boom" {
                panic!("engine exploded");
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.handled.lock().await.push(unit);
        }

        async fn handle_panic(&self, unit: WorkUnit, message: String) {
            self.panics.lock().await.push((unit, message));
        }
    }

    async fn wait_for(handler: &RecordingHandler, count: usize) {
        for _ in 0..200 {
            if handler.handled.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("handler did not process {} units", count);
    }

    #[tokio::test]
    async fn test_workers_run_units_concurrently() {
        let queue = Arc::new(TaskQueue::new(16));
        let handler = Arc::new(RecordingHandler::default());
        let pool = WorkerPool::new(queue.clone(), handler.clone(), 3);
        pool.start();

        for i in 0..6 {
            queue.push_internal(WorkUnit::step(format!("job-{}", i), 0)).unwrap();
        }

        wait_for(&handler, 6).await;
        pool.stop().await;

        let max = handler.max_in_flight.load(Ordering::SeqCst);
        assert!((2..=3).contains(&max), "max in flight was {}", max);
        assert_eq!(pool.status().processed, 6);
        assert!(!pool.status().running);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let queue = Arc::new(TaskQueue::new(16));
        let handler = Arc::new(RecordingHandler::default());
        let pool = WorkerPool::new(queue.clone(), handler.clone(), 1);
        pool.start();

        queue.push_internal(WorkUnit::step("boom", 0)).unwrap();
        queue.push_internal(WorkUnit::step("fine", 0)).unwrap();

        wait_for(&handler, 1).await;
        pool.stop().await;

        let panics = handler.panics.lock().await;
        assert_eq!(panics.len(), 1);
        assert_eq!(panics[0].0, WorkUnit::step("boom", 0));
        assert!(panics[0].1.contains("engine exploded"));
        assert_eq!(pool.status().panicked, 1);
    }

    #[tokio::test]
    async fn test_stop_leaves_queued_units() {
        let queue = Arc::new(TaskQueue::new(16));
        let handler = Arc::new(RecordingHandler::default());
        let pool = WorkerPool::new(queue.clone(), handler.clone(), 1);

        pool.start();
        pool.stop().await;

        queue.push_internal(WorkUnit::step("later", 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 1);
        assert!(handler.handled.lock().await.is_empty());
    }
}
