//! Pipeline orchestrator for the scrape → write → publish stage graph.
//!
//! The orchestrator owns the per-correlation-id state machine:
//!
//! ```text
//! scrape_pending → scrape_done → write_pending → write_done → publish_pending → publish_done
//!        └───────────────┴──────────────┴──────── failed ────────┘
//! ```
//!
//! A stage task is only enqueued once the previous stage has completed, and
//! every stage runs under an in-flight lease, so at most one task per
//! (correlation id, stage) is processed at a time. Stage-level retries are
//! delayed re-enqueues with exponential backoff; provider-level retries
//! already happened inside the dispatch layer by then.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::StageError;
use crate::metrics::MetricsCollector;
use crate::scheduler::queue::{QueueError, QueueNames, TaskQueue};
use crate::scheduler::task::{
    Article, ContentItem, PipelineTask, ScrapeRequest, Stage, StagePayload,
};

use super::config::PipelineConfig;
use super::stages::{Publisher, Scraper, Writer};
use super::state::{FailureRecord, PipelineState, StateError, StateStore};

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Queue backend error.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// State store error.
    #[error("State store error: {0}")]
    State(#[from] StateError),

    /// A stage kept failing until its attempt cap was reached.
    #[error("Stage {stage} of {correlation_id} exceeded its retry budget after {attempts} attempts: {last_error}")]
    StageRetryBudgetExceeded {
        correlation_id: String,
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    /// A stage failed in a way retrying cannot fix.
    #[error("Stage {stage} of {correlation_id} failed permanently: {error}")]
    StageFailed {
        correlation_id: String,
        stage: Stage,
        error: String,
    },
}

/// What happened to one processed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The stage completed and the next stage was enqueued.
    Advanced { next: Stage },
    /// The publish stage completed; the pipeline instance is done.
    Completed,
    /// The stage failed and was re-enqueued with a delay.
    Retrying { attempt: u32, delay: Duration },
    /// The correlation id moved to `failed`.
    Failed { kind: String, error: String },
    /// Another worker holds this stage; the delivery was deferred.
    Duplicate,
    /// The stage or the whole instance had already finished.
    AlreadyDone,
}

impl TaskOutcome {
    /// Metric label of this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::Completed => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Duplicate => "duplicate",
            Self::AlreadyDone => "already_done",
        }
    }
}

/// The three stage handlers.
#[derive(Clone)]
pub struct StageHandlers {
    pub scraper: Arc<dyn Scraper>,
    pub writer: Arc<dyn Writer>,
    pub publisher: Arc<dyn Publisher>,
}

/// Output of a successful stage run.
enum StageOutput {
    Items(Vec<ContentItem>),
    Article(Article),
    Published,
}

/// Coordinates stage execution, chaining and retries.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    queues: QueueNames,
    queue: Arc<dyn TaskQueue>,
    state: Arc<dyn StateStore>,
    handlers: StageHandlers,
    clock: SharedClock,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        queues: QueueNames,
        queue: Arc<dyn TaskQueue>,
        state: Arc<dyn StateStore>,
        handlers: StageHandlers,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            queues,
            queue,
            state,
            handlers,
            clock,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    /// Starts one pipeline instance at `scrape_pending`.
    ///
    /// Without a correlation id a random one is generated. Returns the
    /// correlation id, or `None` if an instance with that id already exists.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` if the state store or the queue fails.
    pub async fn start_pipeline(
        &self,
        request: ScrapeRequest,
        correlation_id: Option<String>,
    ) -> Result<Option<String>, PipelineError> {
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if !self
            .state
            .init(&correlation_id, PipelineState::ScrapePending)
            .await?
        {
            debug!(correlation_id = %correlation_id, "Pipeline instance already exists");
            return Ok(None);
        }

        let task = self.task(&correlation_id, StagePayload::Scrape(request));
        if let Err(e) = self.queue.enqueue_unique(&task).await {
            error!(
                correlation_id = %correlation_id,
                error = %e,
                "Instance recorded but its scrape task was not enqueued"
            );
            return Err(e.into());
        }
        info!(
            correlation_id = %correlation_id,
            queue = %task.queue,
            "Pipeline instance started"
        );
        Ok(Some(correlation_id))
    }

    /// Processes one dequeued task and settles it on the queue.
    ///
    /// Stage failures are handled here and reported through the returned
    /// [`TaskOutcome`]; only infrastructure failures are returned as errors.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` if the state store or the queue fails.
    pub async fn process(&self, task: PipelineTask) -> Result<TaskOutcome, PipelineError> {
        let started = Instant::now();
        let stage = task.stage();

        let outcome = self.process_task(&task).await;
        if let Ok(outcome) = &outcome {
            self.metrics
                .record_stage(stage.as_str(), outcome.label(), started.elapsed());
        }
        outcome
    }

    async fn process_task(&self, task: &PipelineTask) -> Result<TaskOutcome, PipelineError> {
        let cid = task.correlation_id.as_str();
        let stage = task.stage();

        if self
            .state
            .state(cid)
            .await?
            .is_some_and(|state| state.is_terminal())
        {
            debug!(correlation_id = %cid, stage = %stage, "Instance already terminal, dropping task");
            self.queue.ack(task).await?;
            return Ok(TaskOutcome::AlreadyDone);
        }

        let Some(lease) = self
            .state
            .try_lease(cid, stage, self.config.lease_ttl())
            .await?
        else {
            warn!(
                correlation_id = %cid,
                stage = %stage,
                "Stage already in flight, deferring duplicate delivery"
            );
            self.queue
                .retry_later(task, self.config.duplicate_delay())
                .await?;
            return Ok(TaskOutcome::Duplicate);
        };

        let result = self.process_leased(task).await;

        if let Err(e) = self.state.release_lease(&lease).await {
            warn!(correlation_id = %cid, stage = %stage, error = %e, "Failed to release stage lease");
        }
        result
    }

    async fn process_leased(&self, task: &PipelineTask) -> Result<TaskOutcome, PipelineError> {
        let cid = task.correlation_id.as_str();
        let stage = task.stage();

        if self.state.is_stage_complete(cid, stage).await? {
            debug!(correlation_id = %cid, stage = %stage, "Stage already complete");
            self.queue.ack(task).await?;
            return Ok(TaskOutcome::AlreadyDone);
        }

        self.state
            .set_state(cid, PipelineState::pending(stage))
            .await?;
        info!(
            correlation_id = %cid,
            stage = %stage,
            attempt = task.attempts + 1,
            "Running stage"
        );

        let policy = self.config.stages.get(stage);
        let result = match tokio::time::timeout(policy.timeout(), self.run_stage(task)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(policy.timeout())),
        };

        match result {
            Ok(output) => self.advance(task, output).await,
            Err(e) => self.handle_failure(task, e).await,
        }
    }

    async fn run_stage(&self, task: &PipelineTask) -> Result<StageOutput, StageError> {
        match &task.payload {
            StagePayload::Scrape(request) => {
                let items = self.handlers.scraper.scrape(request).await?;
                if items.is_empty() {
                    return Err(StageError::NonRetryable(format!(
                        "no_content: {} yielded no items",
                        request.source_url
                    )));
                }
                Ok(StageOutput::Items(items))
            }
            StagePayload::Write(item) => {
                Ok(StageOutput::Article(self.handlers.writer.write(item).await?))
            }
            StagePayload::Publish(article) => {
                self.handlers.publisher.publish(article).await?;
                Ok(StageOutput::Published)
            }
        }
    }

    /// Chains the next stage, then records completion and settles the task.
    ///
    /// The next stage is enqueued before completion is recorded, so a crash
    /// in between reruns the stage and the unique enqueue absorbs the repeat.
    async fn advance(
        &self,
        task: &PipelineTask,
        output: StageOutput,
    ) -> Result<TaskOutcome, PipelineError> {
        let cid = task.correlation_id.as_str();
        let stage = task.stage();

        let outcome = match output {
            StageOutput::Items(items) => {
                self.fan_out(cid, items).await?;
                TaskOutcome::Advanced { next: Stage::Write }
            }
            StageOutput::Article(article) => {
                let next = self.task(cid, StagePayload::Publish(article));
                self.queue.enqueue_unique(&next).await?;
                TaskOutcome::Advanced {
                    next: Stage::Publish,
                }
            }
            StageOutput::Published => TaskOutcome::Completed,
        };

        self.state.complete_stage(cid, stage).await?;
        match &outcome {
            TaskOutcome::Advanced { next } => {
                self.state.set_state(cid, PipelineState::done(stage)).await?;
                self.state
                    .set_state(cid, PipelineState::pending(*next))
                    .await?;
                info!(correlation_id = %cid, stage = %stage, next = %next, "Stage complete");
            }
            _ => {
                if self.state.finish(cid).await? {
                    self.metrics.record_terminal(PipelineState::PublishDone.as_str());
                }
                info!(correlation_id = %cid, "Pipeline instance published");
            }
        }

        self.queue.ack(task).await?;
        Ok(outcome)
    }

    /// Continues the first item under `cid` and starts a child instance at
    /// `write_pending` for each further item.
    async fn fan_out(&self, cid: &str, items: Vec<ContentItem>) -> Result<(), PipelineError> {
        let total = items.len();
        for (n, item) in items.into_iter().enumerate() {
            let target = if n == 0 {
                cid.to_string()
            } else {
                let child = format!("{}-{}", cid, n);
                if !self
                    .state
                    .init(&child, PipelineState::WritePending)
                    .await?
                {
                    continue;
                }
                child
            };
            let next = self.task(&target, StagePayload::Write(item));
            self.queue.enqueue_unique(&next).await?;
        }
        if total > 1 {
            info!(correlation_id = %cid, children = total - 1, "Scrape fanned out");
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        task: &PipelineTask,
        failure: StageError,
    ) -> Result<TaskOutcome, PipelineError> {
        let cid = task.correlation_id.as_str();
        let stage = task.stage();
        let policy = self.config.stages.get(stage);
        let failures = task.attempts + 1;

        if failure.is_retryable() && policy.allows_retry(failures) {
            let delay = policy.backoff(task.attempts);
            warn!(
                correlation_id = %cid,
                stage = %stage,
                attempt = failures,
                max_attempts = policy.max_attempts,
                delay_secs = delay.as_secs(),
                kind = failure.kind(),
                error = %failure,
                "Stage failed, retrying with backoff"
            );
            self.queue.retry_later(&task.next_attempt(), delay).await?;
            return Ok(TaskOutcome::Retrying {
                attempt: failures,
                delay,
            });
        }

        let err = if failure.is_retryable() {
            PipelineError::StageRetryBudgetExceeded {
                correlation_id: cid.to_string(),
                stage,
                attempts: failures,
                last_error: failure.to_string(),
            }
        } else {
            PipelineError::StageFailed {
                correlation_id: cid.to_string(),
                stage,
                error: failure.to_string(),
            }
        };

        let record = FailureRecord {
            correlation_id: cid.to_string(),
            stage,
            attempts: failures,
            kind: failure.kind().to_string(),
            error: err.to_string(),
            failed_at: self.clock.now(),
        };
        if self.state.fail(&record).await? {
            self.metrics.record_terminal(PipelineState::Failed.as_str());
            error!(
                correlation_id = %cid,
                stage = %stage,
                attempts = failures,
                kind = failure.kind(),
                error = %err,
                "Pipeline instance failed"
            );
        }
        self.queue.dead_letter(task, &err.to_string()).await?;

        Ok(TaskOutcome::Failed {
            kind: failure.kind().to_string(),
            error: err.to_string(),
        })
    }

    fn task(&self, correlation_id: &str, payload: StagePayload) -> PipelineTask {
        let queue = self.queues.for_stage(payload.stage()).to_string();
        PipelineTask::new(correlation_id, payload, queue)
    }
}
