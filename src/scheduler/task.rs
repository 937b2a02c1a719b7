//! Pipeline task definitions.
//!
//! A [`PipelineTask`] is one unit of queued work for a single stage of one
//! content item. Its id is derived from the correlation id and the stage, so
//! every redelivery and retry of the same stage carries the same id.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A phase of the content pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    Write,
    Publish,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Scrape, Stage::Write, Stage::Publish];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::Write => "write",
            Stage::Publish => "publish",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Scrape => Some(Stage::Write),
            Stage::Write => Some(Stage::Publish),
            Stage::Publish => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to look for content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub source_url: String,
    /// Optional search terms used to filter or label results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl ScrapeRequest {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            query: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

/// One scraped content item, input of the write stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub title: String,
    pub url: String,
    pub source_type: String,
    #[serde(default)]
    pub summary: String,
}

/// A generated article, input of the publish stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub content: String,
    pub source_url: String,
    pub source_type: String,
    /// Provider that generated the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Stage-specific input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum StagePayload {
    Scrape(ScrapeRequest),
    Write(ContentItem),
    Publish(Article),
}

impl StagePayload {
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Scrape(_) => Stage::Scrape,
            StagePayload::Write(_) => Stage::Write,
            StagePayload::Publish(_) => Stage::Publish,
        }
    }
}

/// A queued unit of work for one stage of one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTask {
    /// `{correlation_id}/{stage}`; identical across retries.
    pub id: String,
    /// Groups the stages of one content item.
    pub correlation_id: String,
    pub payload: StagePayload,
    /// Failed attempts so far. Starts at 0.
    pub attempts: u32,
    /// Queue the task is routed to.
    pub queue: String,
    pub created_at: DateTime<Utc>,
}

impl PipelineTask {
    pub fn new(
        correlation_id: impl Into<String>,
        payload: StagePayload,
        queue: impl Into<String>,
    ) -> Self {
        let correlation_id = correlation_id.into();
        Self {
            id: task_id(&correlation_id, payload.stage()),
            correlation_id,
            payload,
            attempts: 0,
            queue: queue.into(),
            created_at: Utc::now(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.payload.stage()
    }

    /// Copy of this task for its next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }

    /// Age of the task.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Deterministic id of a (correlation id, stage) pair.
pub fn task_id(correlation_id: &str, stage: Stage) -> String {
    format!("{}/{}", correlation_id, stage)
}
