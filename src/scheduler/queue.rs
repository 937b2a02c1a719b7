//! Durable task queues.
//!
//! Every named queue is made of four collections:
//!
//! - `{prefix}:{queue}`: tasks ready to run (LPUSH in, BRPOPLPUSH out, FIFO)
//! - `{prefix}:{queue}:processing`: tasks handed to a worker (crash recovery)
//! - `{prefix}:{queue}:delayed`: sorted set of retries, scored by due time
//! - `{prefix}:{queue}:dead_letter`: tasks that ended in `failed`
//!
//! Enqueueing is unique per task id: a `{prefix}:task:{id}` marker is taken
//! with `SET NX` and only released when the task is acknowledged or
//! dead-lettered, so a (correlation id, stage) pair is never queued twice.
//!
//! Delivery is at-least-once. A task popped by a worker that dies stays in
//! the processing list until [`TaskQueue::recover_processing`] requeues it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::clock::{to_chrono, SharedClock};
use crate::config::ConfigError;

use super::task::{PipelineTask, Stage};

/// Upper bound on delayed tasks moved per promotion pass.
const PROMOTE_BATCH: usize = 100;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Queue names and the key namespace they live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueNames {
    pub prefix: String,
    pub scraper: String,
    pub writer: String,
    pub publisher: String,
    /// How long a uniqueness marker survives if its task is never settled.
    pub unique_ttl_secs: u64,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            prefix: "hive".to_string(),
            scraper: "scraper".to_string(),
            writer: "writer".to_string(),
            publisher: "publisher".to_string(),
            unique_ttl_secs: 86_400,
        }
    }
}

impl QueueNames {
    /// Queue that carries tasks of `stage`.
    pub fn for_stage(&self, stage: Stage) -> &str {
        match stage {
            Stage::Scrape => &self.scraper,
            Stage::Write => &self.writer,
            Stage::Publish => &self.publisher,
        }
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.scraper.clone(),
            self.writer.clone(),
            self.publisher.clone(),
        ]
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let names = self.all();
        if names.iter().any(String::is_empty) || self.prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue names and prefix cannot be empty".to_string(),
            ));
        }
        if names.iter().collect::<HashSet<_>>().len() != names.len() {
            return Err(ConfigError::ValidationFailed(
                "queue names must be distinct".to_string(),
            ));
        }
        if self.unique_ttl_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "queues.unique_ttl_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Tasks waiting to be processed.
    pub pending_jobs: usize,
    /// Tasks currently held by a worker.
    pub processing_jobs: usize,
    /// Retries waiting for their backoff to elapse.
    pub delayed_jobs: usize,
    /// Tasks that ended in `failed`.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of tasks in all lists.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.delayed_jobs + self.dead_letter_jobs
    }
}

/// Durable transport for pipeline tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues `task` on `task.queue` unless a task with the same id is
    /// already queued, delayed or in flight. Returns whether it was enqueued.
    async fn enqueue_unique(&self, task: &PipelineTask) -> Result<bool, QueueError>;

    /// Pops the next ready task of `queue` into its processing list, waiting
    /// up to `timeout`.
    async fn dequeue(&self, queue: &str, timeout: Duration)
        -> Result<Option<PipelineTask>, QueueError>;

    /// Settles a processed task and releases its uniqueness marker.
    async fn ack(&self, task: &PipelineTask) -> Result<(), QueueError>;

    /// Moves a processed task to the delayed set, due after `delay`.
    ///
    /// The stored copy is `task` as given, so callers bump `attempts` first.
    async fn retry_later(&self, task: &PipelineTask, delay: Duration) -> Result<(), QueueError>;

    /// Moves due delayed tasks of `queue` to its ready list.
    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError>;

    /// Requeues every task left in the processing list of `queue`.
    async fn recover_processing(&self, queue: &str) -> Result<usize, QueueError>;

    /// Moves a processed task to the dead-letter list with its final error.
    async fn dead_letter(&self, task: &PipelineTask, error: &str) -> Result<(), QueueError>;

    /// Most recent dead-letter entries of `queue`, newest first.
    async fn peek_dead_letter(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError>;

    /// Checks connectivity to the backend.
    async fn ping(&self) -> Result<(), QueueError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;
}

fn dead_letter_entry(task: &PipelineTask, error: &str, at: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "job": task,
        "error": error,
        "moved_at": at.to_rfc3339(),
    })
}

/// Redis-backed [`TaskQueue`].
pub struct RedisTaskQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    names: QueueNames,
    clock: SharedClock,
}

impl RedisTaskQueue {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        names: QueueNames,
        clock: SharedClock,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, names, clock))
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, names: QueueNames, clock: SharedClock) -> Self {
        Self {
            redis,
            names,
            clock,
        }
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:{}", self.names.prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:{}:processing", self.names.prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:{}:delayed", self.names.prefix, queue)
    }

    fn dead_letter_key(&self, queue: &str) -> String {
        format!("{}:{}:dead_letter", self.names.prefix, queue)
    }

    fn unique_key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.names.prefix, task_id)
    }

    /// Raw processing-list entry of the task with `task_id`, if present.
    async fn find_processing(&self, queue: &str, task_id: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(self.processing_key(queue), 0, -1).await?;
        Ok(entries.into_iter().find(|raw| {
            serde_json::from_str::<PipelineTask>(raw).is_ok_and(|t| t.id == task_id)
        }))
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue_unique(&self, task: &PipelineTask) -> Result<bool, QueueError> {
        let serialized = serde_json::to_string(task)?;
        let mut conn = self.redis.clone();

        let claimed: Option<String> = redis::cmd("SET")
            .arg(self.unique_key(&task.id))
            .arg(&task.queue)
            .arg("NX")
            .arg("EX")
            .arg(self.names.unique_ttl_secs)
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            return Ok(false);
        }

        conn.lpush::<_, _, ()>(self.ready_key(&task.queue), serialized)
            .await?;
        Ok(true)
    }

    async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<PipelineTask>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        // BRPOPLPUSH atomically pops from source and pushes to destination
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(self.ready_key(queue))
            .arg(self.processing_key(queue))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, task: &PipelineTask) -> Result<(), QueueError> {
        let raw = self.find_processing(&task.queue, &task.id).await?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(raw) = &raw {
            pipe.lrem(self.processing_key(&task.queue), 1, raw);
        }
        pipe.del(self.unique_key(&task.id));
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn retry_later(&self, task: &PipelineTask, delay: Duration) -> Result<(), QueueError> {
        let raw = self.find_processing(&task.queue, &task.id).await?;
        let serialized = serde_json::to_string(task)?;
        let due = self.clock.now() + to_chrono(delay);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(raw) = &raw {
            pipe.lrem(self.processing_key(&task.queue), 1, raw);
        }
        pipe.zadd(self.delayed_key(&task.queue), serialized, due.timestamp_millis());
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError> {
        // Check-and-move must be one step so two promoters never both move a task.
        let script = redis::Script::new(
            r"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
            for _, task in ipairs(due) do
                redis.call('ZREM', KEYS[1], task)
                redis.call('LPUSH', KEYS[2], task)
            end
            return #due
            ",
        );
        let mut conn = self.redis.clone();
        let moved: usize = script
            .key(self.delayed_key(queue))
            .key(self.ready_key(queue))
            .arg(self.clock.now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn recover_processing(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let processing = self.processing_key(queue);
        let entries: Vec<String> = conn.lrange(&processing, 0, -1).await?;
        let mut recovered = 0;

        for raw in entries {
            // Back to the consuming end so recovered work runs first.
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&processing, 1, &raw)
                .rpush(self.ready_key(queue), &raw);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn dead_letter(&self, task: &PipelineTask, error: &str) -> Result<(), QueueError> {
        let raw = self.find_processing(&task.queue, &task.id).await?;
        let entry = serde_json::to_string(&dead_letter_entry(task, error, self.clock.now()))?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(raw) = &raw {
            pipe.lrem(self.processing_key(&task.queue), 1, raw);
        }
        pipe.lpush(self.dead_letter_key(&task.queue), entry)
            .del(self.unique_key(&task.id));
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn peek_dead_letter(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(self.dead_letter_key(queue), 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<serde_json::Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (pending, processing, delayed, dead): (usize, usize, usize, usize) = redis::pipe()
            .llen(self.ready_key(queue))
            .llen(self.processing_key(queue))
            .zcard(self.delayed_key(queue))
            .llen(self.dead_letter_key(queue))
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue_name: queue.to_string(),
            pending_jobs: pending,
            processing_jobs: processing,
            delayed_jobs: delayed,
            dead_letter_jobs: dead,
        })
    }
}

#[derive(Default)]
struct MemoryLists {
    ready: VecDeque<PipelineTask>,
    processing: Vec<PipelineTask>,
    delayed: Vec<(DateTime<Utc>, PipelineTask)>,
    dead_letter: Vec<serde_json::Value>,
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, MemoryLists>,
    unique: HashSet<String>,
}

/// In-process [`TaskQueue`] with the same semantics as the Redis queue.
///
/// Used by tests and single-process runs without Redis. Due times follow the
/// injected clock, so delayed retries can be driven by a manual clock.
pub struct MemoryTaskQueue {
    state: Mutex<MemoryState>,
    notify: Mutex<HashMap<String, Arc<Notify>>>,
    clock: SharedClock,
}

impl MemoryTaskQueue {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            notify: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        let mut notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(notify.entry(queue.to_string()).or_default())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Tasks currently waiting in the delayed set of `queue`.
    pub fn delayed(&self, queue: &str) -> Vec<PipelineTask> {
        self.with_state(|s| {
            s.queues
                .get(queue)
                .map(|l| l.delayed.iter().map(|(_, t)| t.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Tasks currently ready in `queue`, next to run first.
    pub fn ready(&self, queue: &str) -> Vec<PipelineTask> {
        self.with_state(|s| {
            s.queues
                .get(queue)
                .map(|l| l.ready.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Pops the next ready task without waiting.
    pub fn try_dequeue(&self, queue: &str) -> Option<PipelineTask> {
        self.with_state(|s| {
            let lists = s.queues.entry(queue.to_string()).or_default();
            let task = lists.ready.pop_front()?;
            lists.processing.push(task.clone());
            Some(task)
        })
    }
}

fn take_processing(lists: &mut MemoryLists, task_id: &str) {
    if let Some(pos) = lists.processing.iter().position(|t| t.id == task_id) {
        lists.processing.remove(pos);
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue_unique(&self, task: &PipelineTask) -> Result<bool, QueueError> {
        let enqueued = self.with_state(|s| {
            if !s.unique.insert(task.id.clone()) {
                return false;
            }
            s.queues
                .entry(task.queue.clone())
                .or_default()
                .ready
                .push_back(task.clone());
            true
        });
        if enqueued {
            self.notifier(&task.queue).notify_one();
        }
        Ok(enqueued)
    }

    async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<PipelineTask>, QueueError> {
        let notify = self.notifier(queue);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = notify.notified();
            if let Some(task) = self.try_dequeue(queue) {
                return Ok(Some(task));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, task: &PipelineTask) -> Result<(), QueueError> {
        self.with_state(|s| {
            if let Some(lists) = s.queues.get_mut(&task.queue) {
                take_processing(lists, &task.id);
            }
            s.unique.remove(&task.id);
        });
        Ok(())
    }

    async fn retry_later(&self, task: &PipelineTask, delay: Duration) -> Result<(), QueueError> {
        let due = self.clock.now() + to_chrono(delay);
        self.with_state(|s| {
            let lists = s.queues.entry(task.queue.clone()).or_default();
            take_processing(lists, &task.id);
            lists.delayed.push((due, task.clone()));
        });
        Ok(())
    }

    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let moved = self.with_state(|s| {
            let Some(lists) = s.queues.get_mut(queue) else {
                return 0;
            };
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut lists.delayed)
                .into_iter()
                .partition(|(at, _)| *at <= now);
            lists.delayed = waiting;
            let moved = due.len();
            lists.ready.extend(due.into_iter().map(|(_, task)| task));
            moved
        });
        if moved > 0 {
            self.notifier(queue).notify_one();
        }
        Ok(moved)
    }

    async fn recover_processing(&self, queue: &str) -> Result<usize, QueueError> {
        Ok(self.with_state(|s| {
            let Some(lists) = s.queues.get_mut(queue) else {
                return 0;
            };
            let recovered = lists.processing.len();
            for task in lists.processing.drain(..).rev() {
                lists.ready.push_front(task);
            }
            recovered
        }))
    }

    async fn dead_letter(&self, task: &PipelineTask, error: &str) -> Result<(), QueueError> {
        let entry = dead_letter_entry(task, error, self.clock.now());
        self.with_state(|s| {
            let lists = s.queues.entry(task.queue.clone()).or_default();
            take_processing(lists, &task.id);
            lists.dead_letter.insert(0, entry);
            s.unique.remove(&task.id);
        });
        Ok(())
    }

    async fn peek_dead_letter(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        Ok(self.with_state(|s| {
            s.queues
                .get(queue)
                .map(|l| l.dead_letter.iter().take(limit).cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        Ok(self.with_state(|s| {
            let lists = s.queues.get(queue);
            QueueStats {
                queue_name: queue.to_string(),
                pending_jobs: lists.map_or(0, |l| l.ready.len()),
                processing_jobs: lists.map_or(0, |l| l.processing.len()),
                delayed_jobs: lists.map_or(0, |l| l.delayed.len()),
                dead_letter_jobs: lists.map_or(0, |l| l.dead_letter.len()),
            }
        }))
    }
}
