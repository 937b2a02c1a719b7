//! Worker pool for processing pipeline tasks from the stage queues.
//!
//! Every stage queue gets its own set of workers, each running as an
//! independent async task. A single promoter task moves due retries from
//! the delayed sets back into the ready lists.
//!
//! # Features
//!
//! - Configurable number of workers per queue
//! - Graceful shutdown with broadcast channel
//! - Crash recovery of tasks left in processing lists
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;
use crate::pipeline::{PipelineOrchestrator, TaskOutcome};

use super::queue::{QueueError, TaskQueue};
use super::task::PipelineTask;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue backend is unreachable.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers spawned for each stage queue.
    pub workers_per_queue: usize,
    /// How long a dequeue waits for a task before checking again.
    pub dequeue_timeout_secs: u64,
    /// How often due retries are promoted.
    pub promote_interval_secs: u64,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout_secs: u64,
    /// Delay before retrying a task whose processing hit a backend error.
    pub error_backoff_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers_per_queue: 2,
            dequeue_timeout_secs: 2,
            promote_interval_secs: 1,
            shutdown_timeout_secs: 60,
            error_backoff_secs: 30,
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration with the given number of workers per queue.
    pub fn new(workers_per_queue: usize) -> Self {
        Self {
            workers_per_queue,
            ..Default::default()
        }
    }

    pub fn with_dequeue_timeout_secs(mut self, secs: u64) -> Self {
        self.dequeue_timeout_secs = secs;
        self
    }

    pub fn with_shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing tasks.
    pub active_workers: usize,
    /// Stage tasks that completed and advanced their pipeline.
    pub tasks_completed: u64,
    /// Stage tasks re-enqueued for another attempt.
    pub tasks_retried: u64,
    /// Stage tasks that ended their pipeline in `failed`, or hit a backend error.
    pub tasks_failed: u64,
    /// Average task processing duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed.
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_retried + self.tasks_failed
    }

    /// Returns the share of processed tasks that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, counter: &AtomicU64, duration: Duration) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_outcome(&self, outcome: &TaskOutcome, duration: Duration) {
        match outcome {
            TaskOutcome::Advanced { .. } | TaskOutcome::Completed => {
                self.record(&self.tasks_completed, duration)
            }
            TaskOutcome::Retrying { .. } => self.record(&self.tasks_retried, duration),
            TaskOutcome::Failed { .. } => self.record(&self.tasks_failed, duration),
            TaskOutcome::Duplicate | TaskOutcome::AlreadyDone => {}
        }
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let retried = self.tasks_retried.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + retried + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_retried: retried,
            tasks_failed: failed,
            average_task_duration: average_duration,
        }
    }
}

/// Worker pool that drains the scraper, writer and publisher queues.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<dyn TaskQueue>,
    queue_names: Vec<String>,
    orchestrator: Arc<PipelineOrchestrator>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool over the orchestrator's queue backend.
    pub fn new(config: WorkerConfig, orchestrator: Arc<PipelineOrchestrator>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue: Arc::clone(orchestrator.queue()),
            queue_names: orchestrator.queues().all(),
            orchestrator,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the retry promoter.
    ///
    /// Tasks left in processing lists by a previous run are requeued first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or `PoolError::QueueConnection` if the queue backend is unreachable.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        self.queue.ping().await?;

        for name in &self.queue_names {
            match self.queue.recover_processing(name).await {
                Ok(recovered) if recovered > 0 => {
                    info!(queue = %name, recovered = recovered, "Recovered tasks from processing list");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(queue = %name, error = %e, "Failed to recover processing tasks");
                }
            }
        }

        for name in &self.queue_names {
            for i in 0..self.config.workers_per_queue {
                let worker = Worker {
                    id: format!("{}-worker-{}", name, i),
                    queue_name: name.clone(),
                    queue: Arc::clone(&self.queue),
                    orchestrator: Arc::clone(&self.orchestrator),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    dequeue_timeout: self.config.dequeue_timeout(),
                    error_backoff: Duration::from_secs(self.config.error_backoff_secs),
                    stats: Arc::clone(&self.stats),
                    metrics: MetricsCollector::new(),
                };
                self.handles.push(tokio::spawn(worker.run()));
            }
        }

        self.handles.push(tokio::spawn(promote_loop(
            Arc::clone(&self.queue),
            self.queue_names.clone(),
            Duration::from_secs(self.config.promote_interval_secs.max(1)),
            self.shutdown_tx.subscribe(),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            queues = self.queue_names.len(),
            workers_per_queue = self.config.workers_per_queue,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop pulling immediately and finish the task they hold.
    /// Anything still unsettled stays in its processing list and is
    /// recovered on the next start.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let timeout = self.config.shutdown_timeout();
        let handles: Vec<_> = self.handles.drain(..).collect();
        let shutdown_future = async {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers())
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers across all queues.
    pub fn num_workers(&self) -> usize {
        self.config.workers_per_queue * self.queue_names.len()
    }
}

/// Moves due retries into their ready lists and refreshes queue-depth gauges.
async fn promote_loop(
    queue: Arc<dyn TaskQueue>,
    names: Vec<String>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let metrics = MetricsCollector::new();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {}
        }

        for name in &names {
            match queue.promote_due(name).await {
                Ok(0) => {}
                Ok(moved) => debug!(queue = %name, moved = moved, "Promoted due retries"),
                Err(e) => warn!(queue = %name, error = %e, "Failed to promote due retries"),
            }
            if let Ok(stats) = queue.stats(name).await {
                metrics.update_queue_depth(name, stats.pending_jobs + stats.delayed_jobs);
            }
        }
    }
}

/// A single worker that processes tasks from one queue.
pub struct Worker {
    /// Unique identifier for this worker.
    id: String,
    queue_name: String,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    shutdown_rx: broadcast::Receiver<()>,
    dequeue_timeout: Duration,
    error_backoff: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Waits for tasks until a shutdown signal is received. The signal also
    /// interrupts a pending dequeue, so no new task is pulled after it.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            let dequeued = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                result = self.queue.dequeue(&self.queue_name, self.dequeue_timeout) => result,
            };

            match dequeued {
                Ok(Some(task)) => self.process_task(task).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    // Wait before retrying on error
                    tokio::time::sleep(self.dequeue_timeout).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single task.
    async fn process_task(&self, task: PipelineTask) {
        let start_time = Instant::now();
        debug!(
            worker_id = %self.id,
            task_id = %task.id,
            attempt = task.attempts + 1,
            "Processing task"
        );

        self.stats.increment_active();
        self.metrics.increment_active_workers();
        let result = self.orchestrator.process(task.clone()).await;
        self.metrics.decrement_active_workers();
        self.stats.decrement_active();

        let duration = start_time.elapsed();
        match result {
            Ok(outcome) => {
                self.stats.record_outcome(&outcome, duration);
                debug!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    outcome = outcome.label(),
                    duration_ms = duration.as_millis(),
                    "Task processed"
                );
            }
            Err(e) => {
                self.stats.record(&self.stats.tasks_failed, duration);
                error!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    error = %e,
                    "Task processing hit a backend error, deferring"
                );
                // If this fails too, the task stays in the processing list
                // and is recovered on the next start.
                if let Err(requeue_err) = self.queue.retry_later(&task, self.error_backoff).await {
                    error!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        error = %requeue_err,
                        "Failed to defer task"
                    );
                }
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();

        assert_eq!(config.workers_per_queue, 2);
        assert_eq!(config.dequeue_timeout(), Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new(8)
            .with_dequeue_timeout_secs(5)
            .with_shutdown_timeout_secs(120);

        assert_eq!(config.workers_per_queue, 8);
        assert_eq!(config.dequeue_timeout(), Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 6,
            active_workers: 2,
            tasks_completed: 80,
            tasks_retried: 15,
            tasks_failed: 5,
            average_task_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats_by_outcome() {
        let stats = SharedPoolStats::new();

        stats.record_outcome(&TaskOutcome::Completed, Duration::from_secs(10));
        stats.record_outcome(
            &TaskOutcome::Advanced {
                next: crate::scheduler::task::Stage::Write,
            },
            Duration::from_secs(20),
        );
        stats.record_outcome(
            &TaskOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_secs(60),
            },
            Duration::from_secs(5),
        );
        stats.record_outcome(&TaskOutcome::Duplicate, Duration::from_secs(1));

        let pool_stats = stats.to_pool_stats(6);

        assert_eq!(pool_stats.num_workers, 6);
        assert_eq!(pool_stats.tasks_completed, 2);
        assert_eq!(pool_stats.tasks_retried, 1);
        assert_eq!(pool_stats.tasks_failed, 0);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_task_duration.as_millis() > 11000);
        assert!(pool_stats.average_task_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_active_workers() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 2);

        stats.decrement_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }
}
