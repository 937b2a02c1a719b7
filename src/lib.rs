//! hive-forge: resilient multi-provider dispatch for a scrape → write → publish
//! content pipeline.
//!
//! Generation calls are routed across providers and credentials through a
//! credential pool, sliding-window rate limits and per-provider circuit
//! breakers ([`dispatch`]). Pipeline stages travel as tasks on Redis-backed
//! queues ([`scheduler`]) and are chained by the orchestrator ([`pipeline`]).

pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;

pub use config::{ConfigError, HiveConfig};
pub use error::{DispatchError, ProviderError, StageError};
