//! Outcome classification of a single dispatch attempt.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::provider::CredentialId;

/// Classified result of one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Provider signaled throttling.
    RateLimited,
    /// Network failure or 5xx.
    TransientError,
    /// Auth or validation failure; the credential is unusable.
    PermanentError,
    /// Call exceeded its timeout.
    Timeout,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::Success,
        Outcome::RateLimited,
        Outcome::TransientError,
        Outcome::PermanentError,
        Outcome::Timeout,
    ];

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Failures that justify trying another candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Outcome::RateLimited | Outcome::TransientError | Outcome::Timeout
        )
    }

    /// Failures that count toward a provider's circuit breaker.
    ///
    /// A permanent error says something about the credential or the
    /// request, not about the provider's health.
    pub fn counts_against_provider(&self) -> bool {
        self.is_retryable()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimited => "rate_limited",
            Outcome::TransientError => "transient_error",
            Outcome::PermanentError => "permanent_error",
            Outcome::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one try against a (provider, credential) pair.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchAttempt {
    pub provider: String,
    pub credential: CredentialId,
    pub started_at: DateTime<Utc>,
    pub latency: Duration,
    pub outcome: Outcome,
    /// Classified error message for failed attempts.
    pub error: Option<String>,
}
