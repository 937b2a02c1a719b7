//! Content pipeline: scrape → write → publish.
//!
//! # Architecture
//!
//! - **Orchestrator**: runs one stage task, chains the next stage and applies
//!   stage-level retry/backoff
//! - **State**: per-correlation-id state machine, in-flight leases and
//!   terminal records
//! - **Stages**: the scraper, writer and publisher behind narrow traits
//! - **Config**: per-stage retry policies
//!
//! # Pipeline Flow
//!
//! 1. **Trigger**: the beat or a manual trigger starts an instance at `scrape_pending`
//! 2. **Scrape**: the source yields content items; extra items start child instances
//! 3. **Write**: the writer turns an item into an article through the dispatch layer
//! 4. **Publish**: the article is delivered and the instance reaches `publish_done`
//!
//! A stage failure is retried with backoff until the stage's attempt cap,
//! after which the instance moves to `failed` and its task to the dead-letter
//! list.
//!
//! # Example
//!
//! ```rust,ignore
//! use hive_forge::pipeline::{PipelineOrchestrator, StageHandlers};
//! use hive_forge::scheduler::ScrapeRequest;
//!
//! let orchestrator = PipelineOrchestrator::new(config, queues, queue, state, handlers, clock);
//! let cid = orchestrator
//!     .start_pipeline(ScrapeRequest::new("https://news.example.com"), None)
//!     .await?;
//! ```

pub mod config;
pub mod orchestrator;
pub mod stages;
pub mod state;

use std::sync::Arc;

pub use config::{PipelineConfig, StagePolicies, StagePolicy};
pub use orchestrator::{PipelineError, PipelineOrchestrator, StageHandlers, TaskOutcome};
pub use stages::{
    build_publisher, DispatchWriter, LogPublisher, PageScraper, Publisher, Scraper, StagesConfig,
    WebhookPublisher, Writer,
};
pub use state::{
    FailureRecord, MemoryStateStore, PipelineState, RedisStateStore, StateError, StateStore,
    TerminalCounts,
};

use crate::config::ConfigError;
use crate::dispatch::DispatchExecutor;

/// Builds the HTTP-backed stage handlers.
///
/// # Errors
///
/// Returns `ConfigError` if an HTTP client cannot be built.
pub fn build_handlers(
    config: &StagesConfig,
    executor: Arc<DispatchExecutor>,
) -> Result<StageHandlers, ConfigError> {
    Ok(StageHandlers {
        scraper: Arc::new(PageScraper::new(config.scraper.clone())?),
        writer: Arc::new(DispatchWriter::new(executor, config.writer.clone())),
        publisher: build_publisher(&config.publisher)?,
    })
}
