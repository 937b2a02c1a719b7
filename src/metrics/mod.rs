//! Metrics module for Prometheus-based monitoring.
//!
//! Covers provider calls by outcome, circuit and credential health, stage
//! results, terminal pipeline states, queue depth and worker activity.
//!
//! # Example
//!
//! ```ignore
//! use hive_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_stage("write", "advanced", elapsed);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
