//! Error types for hive-forge operations.
//!
//! Defines the error types that cross module boundaries:
//! - Provider adapter failures, already classified into dispatch outcomes
//! - Dispatch layer failures surfaced to the pipeline orchestrator
//! - Stage handler failures (scrape, write, publish)

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::outcome::Outcome;
use crate::dispatch::provider::TaskKind;

/// Errors returned by a provider adapter.
///
/// Every variant maps onto exactly one [`Outcome`], which is what the
/// dispatch layer feeds back into the breaker and the credential pool.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Permanent provider failure ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Classifies a non-success HTTP status.
    ///
    /// 429 is throttling, 408 and 5xx are transient, every other 4xx is a
    /// permanent auth or validation failure.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited {
                message,
                retry_after,
            },
            408 | 425 => Self::Transient(format!("HTTP {}: {}", status, message)),
            400..=499 => Self::Permanent { status, message },
            _ => Self::Transient(format!("HTTP {}: {}", status, message)),
        }
    }

    /// Returns the dispatch outcome for this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::RateLimited { .. } => Outcome::RateLimited,
            Self::Transient(_) | Self::InvalidResponse(_) => Outcome::TransientError,
            Self::Permanent { .. } => Outcome::PermanentError,
            Self::Timeout(_) => Outcome::Timeout,
        }
    }

    /// Provider-supplied throttling hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Why a provider was skipped during candidate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The provider's circuit is open (or a half-open trial is in flight).
    CircuitOpen,
    /// The provider's (or every credential's) rate window is full.
    RateLimited,
    /// Every credential is cooling down.
    CredentialsCoolingDown,
    /// Every credential has been permanently disabled.
    CredentialsDisabled,
}

impl UnavailableReason {
    /// Returns whether waiting can make the provider usable again.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::CredentialsDisabled)
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::CredentialsCoolingDown => write!(f, "credentials_cooling_down"),
            Self::CredentialsDisabled => write!(f, "credentials_disabled"),
        }
    }
}

/// Errors of the dispatch layer.
///
/// `ProviderUnavailable` and `TransientCallFailure` are absorbed inside the
/// executor and turned into routing decisions. Only `AllCandidatesExhausted`,
/// `PermanentCallFailure` and `NoCapableProvider` are returned to callers.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable {
        provider: String,
        reason: UnavailableReason,
    },

    #[error("Transient failure on '{provider}' with {credential} ({outcome}): {message}")]
    TransientCallFailure {
        provider: String,
        credential: String,
        outcome: Outcome,
        message: String,
    },

    #[error("Permanent failure on '{provider}' with {credential}: {message}")]
    PermanentCallFailure {
        provider: String,
        credential: String,
        message: String,
    },

    #[error("All candidates exhausted for {task_kind} task after {attempts} attempts{}", last_error_suffix(.last_error))]
    AllCandidatesExhausted {
        task_kind: TaskKind,
        attempts: usize,
        last_error: Option<String>,
        /// False when no waiting can help (every credential disabled).
        recoverable: bool,
    },

    #[error("No configured provider can handle {0} tasks")]
    NoCapableProvider(TaskKind),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {})", e),
        None => String::new(),
    }
}

impl DispatchError {
    /// Returns whether the orchestrator should retry the stage later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderUnavailable { reason, .. } => reason.is_recoverable(),
            Self::TransientCallFailure { .. } => true,
            Self::AllCandidatesExhausted { recoverable, .. } => *recoverable,
            Self::PermanentCallFailure { .. } | Self::NoCapableProvider(_) => false,
        }
    }
}

/// Errors returned by stage handlers.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("Retryable stage failure: {0}")]
    Retryable(String),

    #[error("Non-retryable stage failure: {0}")]
    NonRetryable(String),

    #[error("Stage exceeded its processing budget of {0:?}")]
    Timeout(Duration),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

impl StageError {
    /// Returns whether the stage task should be re-enqueued.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retryable(_) | Self::Timeout(_) => true,
            Self::NonRetryable(_) => false,
            Self::Dispatch(e) => e.is_retryable(),
        }
    }

    /// Short classification label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "retryable",
            Self::NonRetryable(_) => "non_retryable",
            Self::Timeout(_) => "timeout",
            Self::Dispatch(DispatchError::AllCandidatesExhausted { .. }) => "exhausted",
            Self::Dispatch(_) => "permanent",
        }
    }
}
