//! Per-correlation-id pipeline state.
//!
//! The store records where each content item is in the stage graph, holds the
//! in-flight lease of every (correlation id, stage) pair and guarantees a
//! single terminal record per correlation id no matter how often a task is
//! redelivered.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::{to_chrono, SharedClock};
use crate::scheduler::task::Stage;

use super::config::PipelineConfig;

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown pipeline state '{0}'")]
    UnknownState(String),
}

/// Position of one correlation id in the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    ScrapePending,
    ScrapeDone,
    WritePending,
    WriteDone,
    PublishPending,
    PublishDone,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScrapePending => "scrape_pending",
            Self::ScrapeDone => "scrape_done",
            Self::WritePending => "write_pending",
            Self::WriteDone => "write_done",
            Self::PublishPending => "publish_pending",
            Self::PublishDone => "publish_done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StateError> {
        Ok(match value {
            "scrape_pending" => Self::ScrapePending,
            "scrape_done" => Self::ScrapeDone,
            "write_pending" => Self::WritePending,
            "write_done" => Self::WriteDone,
            "publish_pending" => Self::PublishPending,
            "publish_done" => Self::PublishDone,
            "failed" => Self::Failed,
            other => return Err(StateError::UnknownState(other.to_string())),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PublishDone | Self::Failed)
    }

    pub fn pending(stage: Stage) -> Self {
        match stage {
            Stage::Scrape => Self::ScrapePending,
            Stage::Write => Self::WritePending,
            Stage::Publish => Self::PublishPending,
        }
    }

    pub fn done(stage: Stage) -> Self {
        match stage {
            Stage::Scrape => Self::ScrapeDone,
            Stage::Write => Self::WriteDone,
            Stage::Publish => Self::PublishDone,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A correlation id that ended in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub correlation_id: String,
    pub stage: Stage,
    pub attempts: u32,
    /// Classification label of the final error.
    pub kind: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Number of correlation ids per terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCounts {
    pub publish_done: u64,
    pub failed: u64,
}

/// Proof of holding the in-flight lease of a (correlation id, stage) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub correlation_id: String,
    pub stage: Stage,
    token: String,
}

impl Lease {
    fn new(correlation_id: &str, stage: Stage) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            stage,
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// Storage of pipeline progress.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Records `state` for a new correlation id. Returns false if the id is
    /// already known.
    async fn init(&self, correlation_id: &str, state: PipelineState) -> Result<bool, StateError>;

    /// Moves a non-terminal correlation id to `state`. Terminal records are
    /// never overwritten; returns false in that case.
    async fn set_state(&self, correlation_id: &str, state: PipelineState)
        -> Result<bool, StateError>;

    async fn state(&self, correlation_id: &str) -> Result<Option<PipelineState>, StateError>;

    /// Takes the in-flight lease of a stage, or returns None if another
    /// worker holds it.
    async fn try_lease(
        &self,
        correlation_id: &str,
        stage: Stage,
        ttl: Duration,
    ) -> Result<Option<Lease>, StateError>;

    /// Releases a lease if it is still the one taken.
    async fn release_lease(&self, lease: &Lease) -> Result<(), StateError>;

    /// Marks a stage complete. Returns true only for the first completion.
    async fn complete_stage(&self, correlation_id: &str, stage: Stage) -> Result<bool, StateError>;

    async fn is_stage_complete(&self, correlation_id: &str, stage: Stage)
        -> Result<bool, StateError>;

    /// Records the `publish_done` terminal state. Returns true only once.
    async fn finish(&self, correlation_id: &str) -> Result<bool, StateError>;

    /// Records the `failed` terminal state. Returns true only once.
    async fn fail(&self, record: &FailureRecord) -> Result<bool, StateError>;

    async fn terminal_counts(&self) -> Result<TerminalCounts, StateError>;

    /// Most recent failures, newest first.
    async fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>, StateError>;
}

const SET_STATE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == 'publish_done' or current == 'failed' then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return 1
";

const FINALIZE_SCRIPT: &str = r"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    return 0
end
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[2])
redis.call('HINCRBY', KEYS[3], ARGV[1], 1)
if ARGV[3] ~= '' then
    redis.call('LPUSH', KEYS[4], ARGV[3])
    redis.call('LTRIM', KEYS[4], 0, tonumber(ARGV[4]) - 1)
end
return 1
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Redis-backed [`StateStore`].
pub struct RedisStateStore {
    redis: ConnectionManager,
    prefix: String,
    record_ttl_secs: u64,
    recent_failures: usize,
}

impl RedisStateStore {
    pub fn from_connection(
        redis: ConnectionManager,
        prefix: impl Into<String>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            record_ttl_secs: config.record_ttl_secs,
            recent_failures: config.recent_failures.max(1),
        }
    }

    fn state_key(&self, cid: &str) -> String {
        format!("{}:pipeline:{}:state", self.prefix, cid)
    }

    fn terminal_key(&self, cid: &str) -> String {
        format!("{}:pipeline:{}:terminal", self.prefix, cid)
    }

    fn lease_key(&self, cid: &str, stage: Stage) -> String {
        format!("{}:pipeline:{}:{}:lease", self.prefix, cid, stage)
    }

    fn done_key(&self, cid: &str, stage: Stage) -> String {
        format!("{}:pipeline:{}:{}:done", self.prefix, cid, stage)
    }

    fn counts_key(&self) -> String {
        format!("{}:pipeline:terminal_counts", self.prefix)
    }

    fn failures_key(&self) -> String {
        format!("{}:pipeline:recent_failures", self.prefix)
    }

    async fn finalize(
        &self,
        cid: &str,
        state: PipelineState,
        failure: Option<String>,
    ) -> Result<bool, StateError> {
        let mut conn = self.redis.clone();
        let recorded: i64 = redis::Script::new(FINALIZE_SCRIPT)
            .key(self.terminal_key(cid))
            .key(self.state_key(cid))
            .key(self.counts_key())
            .key(self.failures_key())
            .arg(state.as_str())
            .arg(self.record_ttl_secs)
            .arg(failure.unwrap_or_default())
            .arg(self.recent_failures)
            .invoke_async(&mut conn)
            .await?;
        Ok(recorded == 1)
    }
}

/// `SET key value NX EX ttl`, returning whether the key was set.
async fn set_nx(
    conn: &mut ConnectionManager,
    key: &str,
    value: &str,
    ttl_secs: u64,
) -> Result<bool, redis::RedisError> {
    let set: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(value)
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs.max(1))
        .query_async(conn)
        .await?;
    Ok(set.is_some())
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn init(&self, correlation_id: &str, state: PipelineState) -> Result<bool, StateError> {
        let mut conn = self.redis.clone();
        Ok(set_nx(
            &mut conn,
            &self.state_key(correlation_id),
            state.as_str(),
            self.record_ttl_secs,
        )
        .await?)
    }

    async fn set_state(
        &self,
        correlation_id: &str,
        state: PipelineState,
    ) -> Result<bool, StateError> {
        let mut conn = self.redis.clone();
        let updated: i64 = redis::Script::new(SET_STATE_SCRIPT)
            .key(self.state_key(correlation_id))
            .arg(state.as_str())
            .arg(self.record_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn state(&self, correlation_id: &str) -> Result<Option<PipelineState>, StateError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.state_key(correlation_id)).await?;
        raw.as_deref().map(PipelineState::parse).transpose()
    }

    async fn try_lease(
        &self,
        correlation_id: &str,
        stage: Stage,
        ttl: Duration,
    ) -> Result<Option<Lease>, StateError> {
        let lease = Lease::new(correlation_id, stage);
        let mut conn = self.redis.clone();
        let taken = set_nx(
            &mut conn,
            &self.lease_key(correlation_id, stage),
            &lease.token,
            ttl.as_secs(),
        )
        .await?;
        Ok(taken.then_some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StateError> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.lease_key(&lease.correlation_id, lease.stage))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn complete_stage(&self, correlation_id: &str, stage: Stage) -> Result<bool, StateError> {
        let mut conn = self.redis.clone();
        Ok(set_nx(
            &mut conn,
            &self.done_key(correlation_id, stage),
            "1",
            self.record_ttl_secs,
        )
        .await?)
    }

    async fn is_stage_complete(
        &self,
        correlation_id: &str,
        stage: Stage,
    ) -> Result<bool, StateError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists(self.done_key(correlation_id, stage)).await?)
    }

    async fn finish(&self, correlation_id: &str) -> Result<bool, StateError> {
        self.finalize(correlation_id, PipelineState::PublishDone, None)
            .await
    }

    async fn fail(&self, record: &FailureRecord) -> Result<bool, StateError> {
        let encoded = serde_json::to_string(record)?;
        self.finalize(&record.correlation_id, PipelineState::Failed, Some(encoded))
            .await
    }

    async fn terminal_counts(&self) -> Result<TerminalCounts, StateError> {
        let mut conn = self.redis.clone();
        let counts: HashMap<String, u64> = conn.hgetall(self.counts_key()).await?;
        Ok(TerminalCounts {
            publish_done: counts.get("publish_done").copied().unwrap_or(0),
            failed: counts.get("failed").copied().unwrap_or(0),
        })
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>, StateError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn
            .lrange(self.failures_key(), 0, limit as isize - 1)
            .await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(StateError::from))
            .collect()
    }
}

#[derive(Default)]
struct MemoryInner {
    states: HashMap<String, PipelineState>,
    leases: HashMap<(String, Stage), (String, DateTime<Utc>)>,
    completed: HashSet<(String, Stage)>,
    terminal: HashSet<String>,
    /// Last write per correlation id; drives record expiry.
    written: HashMap<String, DateTime<Utc>>,
    counts: TerminalCounts,
    failures: VecDeque<FailureRecord>,
}

impl MemoryInner {
    fn touch(&mut self, cid: &str, now: DateTime<Utc>) {
        self.written.insert(cid.to_string(), now);
    }

    /// Drops expired leases and every record of a correlation id last
    /// written at or before `horizon`.
    fn expire(&mut self, horizon: DateTime<Utc>, now: DateTime<Utc>) {
        self.leases.retain(|_, (_, expires)| *expires > now);

        let stale: HashSet<String> = self
            .written
            .iter()
            .filter(|(_, at)| **at <= horizon)
            .map(|(cid, _)| cid.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        self.written.retain(|cid, _| !stale.contains(cid));
        self.states.retain(|cid, _| !stale.contains(cid));
        self.terminal.retain(|cid| !stale.contains(cid));
        self.completed.retain(|(cid, _)| !stale.contains(cid));
        self.leases.retain(|(cid, _), _| !stale.contains(cid));
    }
}

/// In-process [`StateStore`]. Lease expiry follows the injected clock.
///
/// Like the Redis store, a correlation id's records expire
/// `record_ttl_secs` after they were last written. Terminal counts and the
/// recent-failures list are kept.
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
    recent_failures: usize,
    record_ttl: Duration,
    clock: SharedClock,
}

impl MemoryStateStore {
    pub fn new(config: &PipelineConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            recent_failures: config.recent_failures.max(1),
            record_ttl: Duration::from_secs(config.record_ttl_secs),
            clock,
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut MemoryInner, DateTime<Utc>) -> R) -> R {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.expire(now - to_chrono(self.record_ttl), now);
        f(&mut inner, now)
    }

    /// Every known correlation id with its current state.
    pub fn states(&self) -> HashMap<String, PipelineState> {
        self.with_inner(|inner, _| inner.states.clone())
    }

    fn finalize(&self, cid: &str, state: PipelineState, failure: Option<&FailureRecord>) -> bool {
        let recent_failures = self.recent_failures;
        self.with_inner(|inner, now| {
            if !inner.terminal.insert(cid.to_string()) {
                return false;
            }
            inner.states.insert(cid.to_string(), state);
            inner.touch(cid, now);
            match state {
                PipelineState::PublishDone => inner.counts.publish_done += 1,
                _ => inner.counts.failed += 1,
            }
            if let Some(record) = failure {
                inner.failures.push_front(record.clone());
                inner.failures.truncate(recent_failures);
            }
            true
        })
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn init(&self, correlation_id: &str, state: PipelineState) -> Result<bool, StateError> {
        Ok(self.with_inner(|inner, now| {
            if inner.states.contains_key(correlation_id) {
                return false;
            }
            inner.states.insert(correlation_id.to_string(), state);
            inner.touch(correlation_id, now);
            true
        }))
    }

    async fn set_state(
        &self,
        correlation_id: &str,
        state: PipelineState,
    ) -> Result<bool, StateError> {
        Ok(self.with_inner(|inner, now| {
            let current = inner.states.entry(correlation_id.to_string()).or_insert(state);
            if current.is_terminal() {
                return false;
            }
            *current = state;
            inner.touch(correlation_id, now);
            true
        }))
    }

    async fn state(&self, correlation_id: &str) -> Result<Option<PipelineState>, StateError> {
        Ok(self.with_inner(|inner, _| inner.states.get(correlation_id).copied()))
    }

    async fn try_lease(
        &self,
        correlation_id: &str,
        stage: Stage,
        ttl: Duration,
    ) -> Result<Option<Lease>, StateError> {
        Ok(self.with_inner(|inner, now| {
            let key = (correlation_id.to_string(), stage);
            if inner
                .leases
                .get(&key)
                .is_some_and(|(_, expires)| *expires > now)
            {
                return None;
            }
            let lease = Lease::new(correlation_id, stage);
            inner
                .leases
                .insert(key, (lease.token.clone(), now + to_chrono(ttl)));
            Some(lease)
        }))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StateError> {
        self.with_inner(|inner, _| {
            let key = (lease.correlation_id.clone(), lease.stage);
            if inner
                .leases
                .get(&key)
                .is_some_and(|(token, _)| *token == lease.token)
            {
                inner.leases.remove(&key);
            }
        });
        Ok(())
    }

    async fn complete_stage(&self, correlation_id: &str, stage: Stage) -> Result<bool, StateError> {
        Ok(self.with_inner(|inner, now| {
            let inserted = inner.completed.insert((correlation_id.to_string(), stage));
            if inserted {
                inner.touch(correlation_id, now);
            }
            inserted
        }))
    }

    async fn is_stage_complete(
        &self,
        correlation_id: &str,
        stage: Stage,
    ) -> Result<bool, StateError> {
        Ok(self.with_inner(|inner, _| {
            inner
                .completed
                .contains(&(correlation_id.to_string(), stage))
        }))
    }

    async fn finish(&self, correlation_id: &str) -> Result<bool, StateError> {
        Ok(self.finalize(correlation_id, PipelineState::PublishDone, None))
    }

    async fn fail(&self, record: &FailureRecord) -> Result<bool, StateError> {
        Ok(self.finalize(&record.correlation_id, PipelineState::Failed, Some(record)))
    }

    async fn terminal_counts(&self) -> Result<TerminalCounts, StateError> {
        Ok(self.with_inner(|inner, _| inner.counts))
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>, StateError> {
        Ok(self.with_inner(|inner, _| inner.failures.iter().take(limit).cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;

    fn store() -> (MemoryStateStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = PipelineConfig {
            recent_failures: 2,
            ..Default::default()
        };
        (MemoryStateStore::new(&config, clock.clone()), clock)
    }

    fn failure(cid: &str) -> FailureRecord {
        FailureRecord {
            correlation_id: cid.to_string(),
            stage: Stage::Write,
            attempts: 3,
            kind: "exhausted".to_string(),
            error: "all candidates exhausted".to_string(),
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            PipelineState::ScrapePending,
            PipelineState::WriteDone,
            PipelineState::PublishDone,
            PipelineState::Failed,
        ] {
            assert_eq!(PipelineState::parse(state.as_str()).expect("known"), state);
        }
        assert!(PipelineState::parse("archived").is_err());
        assert_eq!(PipelineState::pending(Stage::Write), PipelineState::WritePending);
        assert!(PipelineState::done(Stage::Publish).is_terminal());
    }

    #[tokio::test]
    async fn test_init_only_once() {
        let (store, _) = store();
        assert!(store.init("c1", PipelineState::ScrapePending).await.expect("init"));
        assert!(!store.init("c1", PipelineState::ScrapePending).await.expect("init"));
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let (store, _) = store();
        store.init("c1", PipelineState::ScrapePending).await.expect("init");

        assert!(store.fail(&failure("c1")).await.expect("fail"));
        assert!(!store.fail(&failure("c1")).await.expect("fail"));
        assert!(!store.finish("c1").await.expect("finish"));
        assert!(!store
            .set_state("c1", PipelineState::WritePending)
            .await
            .expect("set"));

        assert_eq!(
            store.state("c1").await.expect("state"),
            Some(PipelineState::Failed)
        );
        let counts = store.terminal_counts().await.expect("counts");
        assert_eq!((counts.publish_done, counts.failed), (0, 1));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released_or_expired() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(60);

        let lease = store
            .try_lease("c1", Stage::Write, ttl)
            .await
            .expect("lease")
            .expect("first lease granted");
        assert!(store.try_lease("c1", Stage::Write, ttl).await.expect("lease").is_none());
        // Other stages are independent.
        assert!(store.try_lease("c1", Stage::Publish, ttl).await.expect("lease").is_some());

        store.release_lease(&lease).await.expect("release");
        let second = store
            .try_lease("c1", Stage::Write, ttl)
            .await
            .expect("lease")
            .expect("released lease can be retaken");

        clock.advance(Duration::from_secs(61));
        let third = store
            .try_lease("c1", Stage::Write, ttl)
            .await
            .expect("lease")
            .expect("expired lease can be retaken");

        // A stale holder cannot release the new lease.
        store.release_lease(&second).await.expect("release");
        assert!(store.try_lease("c1", Stage::Write, ttl).await.expect("lease").is_none());
        store.release_lease(&third).await.expect("release");
    }

    #[tokio::test]
    async fn test_complete_stage_first_wins() {
        let (store, _) = store();
        assert!(store.complete_stage("c1", Stage::Scrape).await.expect("complete"));
        assert!(!store.complete_stage("c1", Stage::Scrape).await.expect("complete"));
        assert!(store.is_stage_complete("c1", Stage::Scrape).await.expect("check"));
        assert!(!store.is_stage_complete("c1", Stage::Write).await.expect("check"));
    }

    #[tokio::test]
    async fn test_recent_failures_are_capped() {
        let (store, _) = store();
        for cid in ["a", "b", "c"] {
            store.fail(&failure(cid)).await.expect("fail");
        }

        let recent = store.recent_failures(10).await.expect("recent");
        let ids: Vec<_> = recent.iter().map(|r| r.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_records_expire_after_last_write() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = PipelineConfig {
            record_ttl_secs: 3600,
            ..Default::default()
        };
        let store = MemoryStateStore::new(&config, clock.clone());

        store.init("done", PipelineState::ScrapePending).await.expect("init");
        store.complete_stage("done", Stage::Scrape).await.expect("complete");
        store.finish("done").await.expect("finish");
        clock.advance(Duration::from_secs(1800));
        store.init("live", PipelineState::WritePending).await.expect("init");

        clock.advance(Duration::from_secs(1800));
        assert_eq!(store.state("done").await.expect("state"), None);
        assert!(!store.is_stage_complete("done", Stage::Scrape).await.expect("check"));
        assert_eq!(
            store.state("live").await.expect("state"),
            Some(PipelineState::WritePending)
        );
        assert_eq!(store.states().len(), 1);

        // Counters outlive the records they summarize.
        let counts = store.terminal_counts().await.expect("counts");
        assert_eq!(counts.publish_done, 1);
        // An expired id can start over.
        assert!(store.init("done", PipelineState::ScrapePending).await.expect("init"));
    }
}
