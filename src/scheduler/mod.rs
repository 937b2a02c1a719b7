//! Task transport and execution for the stage queues.
//!
//! This module provides the infrastructure that moves pipeline tasks:
//!
//! - **TaskQueue**: durable, unique-per-task queue with reliable dequeue
//!   (BRPOPLPUSH), delayed retries and a dead-letter list
//! - **WorkerPool**: workers per stage queue plus a retry promoter
//! - **Beat**: recurring trigger, idempotent per time bucket
//! - **PipelineTask**: one stage of one content item
//!
//! # Architecture
//!
//! ```text
//!        ┌────────────┐      ┌──────────────┐
//!        │    Beat    │      │ CLI trigger  │
//!        └─────┬──────┘      └──────┬───────┘
//!              └──────────┬─────────┘
//!                  ┌──────▼───────┐
//!                  │   scraper    │──┐
//!                  ├──────────────┤  │  stage chaining
//!                  │    writer    │◄─┤  by the orchestrator
//!                  ├──────────────┤  │
//!                  │  publisher   │◄─┘
//!                  └──────┬───────┘
//!         ┌───────────────┼───────────────┐
//!         ▼               ▼               ▼
//!    ┌─────────┐     ┌─────────┐     ┌─────────┐
//!    │ workers │     │ workers │     │ workers │
//!    └─────────┘     └─────────┘     └─────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: tasks move to a processing list as they are popped
//! - **Crash recovery**: processing lists are requeued when the pool starts
//! - **Delayed retry**: backoff is a sorted set promoted when due
//! - **Dead letter queue**: tasks of failed instances are kept for analysis
//! - **Graceful shutdown**: workers stop pulling and finish their current task

pub mod beat;
pub mod queue;
pub mod task;
pub mod worker_pool;

// Re-export main types for convenience
pub use beat::{Beat, ScheduleConfig};
pub use queue::{MemoryTaskQueue, QueueError, QueueNames, QueueStats, RedisTaskQueue, TaskQueue};
pub use task::{Article, ContentItem, PipelineTask, ScrapeRequest, Stage, StagePayload};
pub use worker_pool::{PoolError, PoolStats, Worker, WorkerConfig, WorkerPool};
