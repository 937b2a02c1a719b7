//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by hive-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all hive-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Provider calls, labeled by provider and classified outcome.
pub static DISPATCH_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Provider call latency in seconds, labeled by provider.
pub static DISPATCH_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Dispatch requests that ended without a response, labeled by task kind and error.
pub static DISPATCH_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Circuit state per provider (0 closed, 1 half-open, 2 open).
pub static CIRCUIT_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Credentials currently available per provider.
pub static CREDENTIALS_AVAILABLE: OnceLock<GaugeVec> = OnceLock::new();

/// Stage task executions, labeled by stage and result.
pub static STAGE_TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage handler duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Pipeline instances reaching a terminal state, labeled by state.
pub static PIPELINES_TERMINAL_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of tasks in each queue list, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers currently processing a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Dispatch metrics
    let dispatch_attempts_total = CounterVec::new(
        Opts::new(
            "hive_forge_dispatch_attempts_total",
            "Provider calls by classified outcome",
        ),
        &["provider", "outcome"],
    )?;

    let dispatch_latency = HistogramVec::new(
        HistogramOpts::new(
            "hive_forge_dispatch_latency_seconds",
            "Provider call latency in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["provider"],
    )?;

    let dispatch_failures_total = CounterVec::new(
        Opts::new(
            "hive_forge_dispatch_failures_total",
            "Dispatch requests that ended without a response",
        ),
        &["task_kind", "error"],
    )?;

    let circuit_state = GaugeVec::new(
        Opts::new(
            "hive_forge_circuit_state",
            "Circuit state per provider (0 closed, 1 half-open, 2 open)",
        ),
        &["provider"],
    )?;

    let credentials_available = GaugeVec::new(
        Opts::new(
            "hive_forge_credentials_available",
            "Credentials currently available per provider",
        ),
        &["provider"],
    )?;

    // Pipeline metrics
    let stage_tasks_total = CounterVec::new(
        Opts::new("hive_forge_stage_tasks_total", "Stage task executions by result"),
        &["stage", "result"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "hive_forge_stage_duration_seconds",
            "Stage handler duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["stage"],
    )?;

    let pipelines_terminal_total = CounterVec::new(
        Opts::new(
            "hive_forge_pipelines_terminal_total",
            "Pipeline instances reaching a terminal state",
        ),
        &["state"],
    )?;

    // Queue and worker metrics
    let queue_depth = GaugeVec::new(
        Opts::new("hive_forge_queue_depth", "Number of tasks in queue lists"),
        &["queue_name"],
    )?;

    let active_workers = Gauge::new(
        "hive_forge_active_workers",
        "Number of workers currently processing a task",
    )?;

    registry.register(Box::new(dispatch_attempts_total.clone()))?;
    registry.register(Box::new(dispatch_latency.clone()))?;
    registry.register(Box::new(dispatch_failures_total.clone()))?;
    registry.register(Box::new(circuit_state.clone()))?;
    registry.register(Box::new(credentials_available.clone()))?;
    registry.register(Box::new(stage_tasks_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(pipelines_terminal_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were initialized concurrently
    let _ = REGISTRY.set(registry);
    let _ = DISPATCH_ATTEMPTS_TOTAL.set(dispatch_attempts_total);
    let _ = DISPATCH_LATENCY.set(dispatch_latency);
    let _ = DISPATCH_FAILURES_TOTAL.set(dispatch_failures_total);
    let _ = CIRCUIT_STATE.set(circuit_state);
    let _ = CREDENTIALS_AVAILABLE.set(credentials_available);
    let _ = STAGE_TASKS_TOTAL.set(stage_tasks_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = PIPELINES_TERMINAL_TOTAL.set(pipelines_terminal_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_recording() {
        init_metrics().expect("metrics should initialize");
        DISPATCH_ATTEMPTS_TOTAL
            .get()
            .expect("counter registered")
            .with_label_values(&["groq", "success"])
            .inc();

        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("hive_forge_dispatch_attempts_total"));
    }
}
