//! Recurring pipeline trigger.
//!
//! Time is cut into buckets of `interval_secs`. Each configured source gets
//! one pipeline instance per bucket, with a correlation id derived from the
//! bucket and the source. Starting an instance is idempotent per correlation
//! id, so restarts, overlapping beats and frequent checks never double-fire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::pipeline::{PipelineError, PipelineOrchestrator};

use super::task::ScrapeRequest;

/// Longest pause between two bucket checks.
const MAX_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Recurring schedule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Length of one scheduling bucket.
    pub interval_secs: u64,
    /// Sources scraped once per bucket.
    pub sources: Vec<ScrapeRequest>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            sources: Vec::new(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Timer-driven enqueuer of new pipeline instances.
pub struct Beat {
    config: ScheduleConfig,
    orchestrator: Arc<PipelineOrchestrator>,
    clock: SharedClock,
}

impl Beat {
    pub fn new(
        config: ScheduleConfig,
        orchestrator: Arc<PipelineOrchestrator>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            orchestrator,
            clock,
        }
    }

    /// Index of the bucket containing `at`.
    pub fn bucket(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.config.interval_secs.max(1) as i64)
    }

    /// Deterministic correlation id of `source` in `bucket`.
    pub fn correlation_id(source: &ScrapeRequest, bucket: i64) -> String {
        let name = format!(
            "{}|{}|{}",
            bucket,
            source.source_url,
            source.query.as_deref().unwrap_or_default()
        );
        format!("beat-{}-{}", bucket, Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }

    /// Starts the instances of the current bucket that do not exist yet.
    ///
    /// Returns the number of instances started.
    ///
    /// # Errors
    ///
    /// Returns the first `PipelineError`; sources before it stay started.
    pub async fn fire(&self) -> Result<usize, PipelineError> {
        let bucket = self.bucket(self.clock.now());
        let mut started = 0;

        for source in &self.config.sources {
            let cid = Self::correlation_id(source, bucket);
            if self
                .orchestrator
                .start_pipeline(source.clone(), Some(cid))
                .await?
                .is_some()
            {
                started += 1;
            }
        }

        if started > 0 {
            info!(bucket = bucket, started = started, "Beat started pipeline instances");
        } else {
            debug!(bucket = bucket, "Beat bucket already fired");
        }
        Ok(started)
    }

    /// Runs the beat until a shutdown signal arrives.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.config.sources.is_empty() {
                warn!("Beat enabled without sources, nothing to schedule");
            }
            let period = self.config.interval().min(MAX_CHECK_PERIOD);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.interval_secs,
                sources = self.config.sources.len(),
                "Beat started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.fire().await {
                    error!(error = %e, "Beat failed to start pipeline instances");
                }
            }

            info!("Beat stopped");
        })
    }
}
