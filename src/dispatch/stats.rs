//! Live per-provider call statistics.
//!
//! Counters only cover the current process lifetime; they feed the health
//! report's failure-rate alert and are never persisted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::outcome::Outcome;

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    rate_limited: AtomicU64,
    transient: AtomicU64,
    permanent: AtomicU64,
    timeouts: AtomicU64,
}

/// Aggregate call counts for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub provider: String,
    pub attempts: u64,
    pub successes: u64,
    pub rate_limited: u64,
    pub transient_errors: u64,
    pub permanent_errors: u64,
    pub timeouts: u64,
}

impl ProviderUsage {
    pub fn failures(&self) -> u64 {
        self.attempts.saturating_sub(self.successes)
    }

    /// Failed fraction of all attempts, in percent.
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.failures() as f64 / self.attempts as f64 * 100.0
    }
}

/// Outcome counters keyed by provider name.
#[derive(Debug, Default)]
pub struct ProviderStats {
    counters: HashMap<String, Counters>,
}

impl ProviderStats {
    /// Creates counters for a fixed provider set.
    pub fn new<'a>(providers: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            counters: providers
                .into_iter()
                .map(|name| (name.to_string(), Counters::default()))
                .collect(),
        }
    }

    pub fn record(&self, provider: &str, outcome: Outcome) {
        let Some(counters) = self.counters.get(provider) else {
            return;
        };
        counters.attempts.fetch_add(1, Ordering::SeqCst);
        let bucket = match outcome {
            Outcome::Success => &counters.successes,
            Outcome::RateLimited => &counters.rate_limited,
            Outcome::TransientError => &counters.transient,
            Outcome::PermanentError => &counters.permanent,
            Outcome::Timeout => &counters.timeouts,
        };
        bucket.fetch_add(1, Ordering::SeqCst);
    }

    pub fn usage(&self, provider: &str) -> ProviderUsage {
        let Some(c) = self.counters.get(provider) else {
            return ProviderUsage {
                provider: provider.to_string(),
                ..Default::default()
            };
        };
        ProviderUsage {
            provider: provider.to_string(),
            attempts: c.attempts.load(Ordering::SeqCst),
            successes: c.successes.load(Ordering::SeqCst),
            rate_limited: c.rate_limited.load(Ordering::SeqCst),
            transient_errors: c.transient.load(Ordering::SeqCst),
            permanent_errors: c.permanent.load(Ordering::SeqCst),
            timeouts: c.timeouts.load(Ordering::SeqCst),
        }
    }
}
