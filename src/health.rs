//! Health-check query and snapshot publication.
//!
//! [`HealthChecker::check`] aggregates queue connectivity, per-provider
//! circuit and credential state, rate-window usage, live failure rates and
//! terminal pipeline counts into one [`HealthReport`]. The running service
//! publishes the report (and the Prometheus text) to Redis with a TTL so the
//! CLI can read it from another process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::dispatch::{BreakerSnapshot, CircuitState, DispatchExecutor, ProviderUsage, WindowUsage};
use crate::metrics::{export_metrics, MetricsCollector};
use crate::pipeline::{FailureRecord, StateStore, TerminalCounts};
use crate::scheduler::queue::{QueueStats, TaskQueue};

/// Health reporting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// How often the running service publishes its report.
    pub publish_interval_secs: u64,
    /// Lifetime of a published report; a stale service stops showing up.
    pub snapshot_ttl_secs: u64,
    /// Provider failure rate (percent) above which an alert is raised.
    pub alert_failure_rate: f64,
    /// Attempts needed before the failure rate is judged.
    pub alert_min_attempts: u64,
    /// Rate-window usage (percent) above which an alert is raised.
    pub usage_alert_percent: f64,
    /// Recent terminal failures included in the report.
    pub recent_failures: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: 30,
            snapshot_ttl_secs: 120,
            alert_failure_rate: 50.0,
            alert_min_attempts: 10,
            usage_alert_percent: 80.0,
            recent_failures: 10,
        }
    }
}

/// Aggregate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue backend connectivity and depths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queues: Vec<QueueStats>,
}

/// Health of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub name: String,
    pub circuit: BreakerSnapshot,
    pub credentials_total: usize,
    pub credentials_available: usize,
    pub windows: Vec<WindowUsage>,
    pub usage: ProviderUsage,
}

impl ProviderHealth {
    /// Whether the router could currently pick this provider at all.
    pub fn is_usable(&self) -> bool {
        self.circuit.state != CircuitState::Open && self.credentials_available > 0
    }
}

/// Pipeline outcome summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub terminal: TerminalCounts,
    pub recent_failures: Vec<FailureRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a health-check query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub queue: QueueHealth,
    pub providers: Vec<ProviderHealth>,
    pub pipelines: PipelineHealth,
    pub alerts: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Builds health reports from live component state.
pub struct HealthChecker {
    config: HealthConfig,
    executor: Arc<DispatchExecutor>,
    queue: Arc<dyn TaskQueue>,
    state: Arc<dyn StateStore>,
    queue_names: Vec<String>,
    clock: SharedClock,
    metrics: MetricsCollector,
}

impl HealthChecker {
    pub fn new(
        config: HealthConfig,
        executor: Arc<DispatchExecutor>,
        queue: Arc<dyn TaskQueue>,
        state: Arc<dyn StateStore>,
        queue_names: Vec<String>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            executor,
            queue,
            state,
            queue_names,
            clock,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Runs the health-check query. Backend failures are reported, not returned.
    pub async fn check(&self) -> HealthReport {
        let mut alerts = Vec::new();

        let queue = self.queue_health().await;
        if let Some(error) = &queue.error {
            alerts.push(format!("queue backend unreachable: {}", error));
        }

        let providers: Vec<ProviderHealth> = self
            .executor
            .providers()
            .iter()
            .map(|p| self.provider_health(&p.name))
            .collect();
        for provider in &providers {
            alerts.extend(self.provider_alerts(provider));
        }

        let pipelines = self.pipeline_health().await;
        if let Some(error) = &pipelines.error {
            alerts.push(format!("state store unreachable: {}", error));
        }

        let status = if !queue.connected || !providers.iter().any(ProviderHealth::is_usable) {
            HealthStatus::Unhealthy
        } else if !alerts.is_empty()
            || providers
                .iter()
                .any(|p| p.circuit.state != CircuitState::Closed)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        for alert in &alerts {
            warn!(alert = %alert, "Health alert");
        }
        debug!(status = %status, providers = providers.len(), "Health check complete");

        HealthReport {
            status,
            generated_at: self.clock.now(),
            queue,
            providers,
            pipelines,
            alerts,
        }
    }

    async fn queue_health(&self) -> QueueHealth {
        if let Err(e) = self.queue.ping().await {
            return QueueHealth {
                connected: false,
                error: Some(e.to_string()),
                queues: Vec::new(),
            };
        }

        let mut queues = Vec::with_capacity(self.queue_names.len());
        for name in &self.queue_names {
            match self.queue.stats(name).await {
                Ok(stats) => {
                    self.metrics
                        .update_queue_depth(name, stats.pending_jobs + stats.delayed_jobs);
                    queues.push(stats);
                }
                Err(e) => {
                    return QueueHealth {
                        connected: false,
                        error: Some(e.to_string()),
                        queues,
                    }
                }
            }
        }

        QueueHealth {
            connected: true,
            error: None,
            queues,
        }
    }

    fn provider_health(&self, name: &str) -> ProviderHealth {
        let router = self.executor.router();
        let circuit = router.breaker().snapshot(name);
        let credentials_available = router.pool().available(name);

        self.metrics
            .update_circuit_state(name, circuit.state.as_gauge());
        self.metrics
            .update_credentials_available(name, credentials_available);

        ProviderHealth {
            name: name.to_string(),
            circuit,
            credentials_total: router.pool().total(name),
            credentials_available,
            windows: router.limiter().usage(name),
            usage: self.executor.usage(name),
        }
    }

    fn provider_alerts(&self, provider: &ProviderHealth) -> Vec<String> {
        let mut alerts = Vec::new();

        if provider.usage.attempts >= self.config.alert_min_attempts
            && provider.usage.failure_rate() > self.config.alert_failure_rate
        {
            alerts.push(format!(
                "provider {} failure rate {:.1}% over {} attempts",
                provider.name,
                provider.usage.failure_rate(),
                provider.usage.attempts
            ));
        }

        for window in &provider.windows {
            if window.percent() >= self.config.usage_alert_percent {
                alerts.push(format!(
                    "provider {} used {}/{} calls of its {}s window",
                    provider.name, window.used, window.capacity, window.window_secs
                ));
            }
        }

        if provider.credentials_total > 0 && provider.credentials_available == 0 {
            alerts.push(format!("provider {} has no available credential", provider.name));
        }

        alerts
    }

    async fn pipeline_health(&self) -> PipelineHealth {
        let terminal = self.state.terminal_counts().await;
        let recent = self
            .state
            .recent_failures(self.config.recent_failures)
            .await;

        match (terminal, recent) {
            (Ok(terminal), Ok(recent_failures)) => PipelineHealth {
                terminal,
                recent_failures,
                error: None,
            },
            (Err(e), _) | (_, Err(e)) => PipelineHealth {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Reads and writes health snapshots in Redis.
#[derive(Clone)]
pub struct HealthSnapshotStore {
    redis: ConnectionManager,
    prefix: String,
}

impl HealthSnapshotStore {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn report_key(&self) -> String {
        format!("{}:health:report", self.prefix)
    }

    fn metrics_key(&self) -> String {
        format!("{}:health:metrics", self.prefix)
    }

    /// Stores `report` and the current Prometheus text for `ttl`.
    pub async fn publish(&self, report: &HealthReport, ttl: Duration) -> Result<(), redis::RedisError> {
        let encoded = serde_json::to_string(report).map_err(|e| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string()))
        })?;
        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.redis.clone();

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.report_key())
            .arg(encoded)
            .arg("EX")
            .arg(ttl_secs)
            .ignore()
            .cmd("SET")
            .arg(self.metrics_key())
            .arg(export_metrics())
            .arg("EX")
            .arg(ttl_secs)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
    }

    /// Latest published report, if a service is alive.
    pub async fn latest_report(&self) -> Result<Option<HealthReport>, redis::RedisError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.report_key()).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    /// Latest published Prometheus text.
    pub async fn latest_metrics(&self) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.redis.clone();
        conn.get(self.metrics_key()).await
    }
}

/// Periodically publishes health reports until a shutdown signal arrives.
pub fn spawn_publisher(
    checker: Arc<HealthChecker>,
    store: HealthSnapshotStore,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = checker.config().clone();
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.publish_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ttl = Duration::from_secs(config.snapshot_ttl_secs);
        info!(
            interval_secs = config.publish_interval_secs,
            "Health publisher started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }
            let report = checker.check().await;
            if let Err(e) = store.publish(&report, ttl).await {
                warn!(error = %e, "Failed to publish health report");
            }
        }
    })
}
