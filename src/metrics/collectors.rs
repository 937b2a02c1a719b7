//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code and tests can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, CIRCUIT_STATE, CREDENTIALS_AVAILABLE, DISPATCH_ATTEMPTS_TOTAL,
    DISPATCH_FAILURES_TOTAL, DISPATCH_LATENCY, PIPELINES_TERMINAL_TOTAL, QUEUE_DEPTH,
    STAGE_DURATION, STAGE_TASKS_TOTAL,
};

/// Metrics collector for recording hive-forge operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one provider call.
    pub fn record_dispatch_attempt(&self, provider: &str, outcome: &str, latency: Duration) {
        if let Some(attempts) = DISPATCH_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[provider, outcome]).inc();
        }

        if let Some(latency_hist) = DISPATCH_LATENCY.get() {
            latency_hist
                .with_label_values(&[provider])
                .observe(latency.as_secs_f64());
        }

        tracing::trace!(
            provider = provider,
            outcome = outcome,
            latency_ms = latency.as_millis() as u64,
            "Recorded dispatch attempt metric"
        );
    }

    /// Record a dispatch request that returned an error to its caller.
    pub fn record_dispatch_failure(&self, task_kind: &str, error: &str) {
        if let Some(failures) = DISPATCH_FAILURES_TOTAL.get() {
            failures.with_label_values(&[task_kind, error]).inc();
        }
    }

    /// Update a provider's circuit-state gauge.
    pub fn update_circuit_state(&self, provider: &str, value: f64) {
        if let Some(gauge) = CIRCUIT_STATE.get() {
            gauge.with_label_values(&[provider]).set(value);
        }
    }

    /// Update a provider's available-credential gauge.
    pub fn update_credentials_available(&self, provider: &str, available: usize) {
        if let Some(gauge) = CREDENTIALS_AVAILABLE.get() {
            gauge.with_label_values(&[provider]).set(available as f64);
        }
    }

    /// Record one stage task execution.
    ///
    /// `result` is one of "advanced", "completed", "retrying", "failed" or
    /// "duplicate".
    pub fn record_stage(&self, stage: &str, result: &str, duration: Duration) {
        if let Some(tasks) = STAGE_TASKS_TOTAL.get() {
            tasks.with_label_values(&[stage, result]).inc();
        }

        if let Some(duration_hist) = STAGE_DURATION.get() {
            duration_hist
                .with_label_values(&[stage])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            stage = stage,
            result = result,
            duration_ms = duration.as_millis() as u64,
            "Recorded stage metric"
        );
    }

    /// Record a pipeline instance reaching a terminal state.
    pub fn record_terminal(&self, state: &str) {
        if let Some(terminal) = PIPELINES_TERMINAL_TOTAL.get() {
            terminal.with_label_values(&[state]).inc();
        }
    }

    /// Update the depth gauge of one queue list.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }
    }

    pub fn increment_active_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn decrement_active_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}
