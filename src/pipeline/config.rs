//! Stage retry policies for the pipeline orchestrator.
//!
//! Each stage carries its own retry budget, backoff schedule and total
//! processing budget. Provider-level retries happen inside the dispatch
//! layer; these policies only govern re-enqueueing whole stage tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::scheduler::task::Stage;

/// Retry and timeout policy of a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on each subsequent retry.
    pub base_backoff_secs: u64,
    /// Upper bound on the retry delay.
    pub max_backoff_secs: u64,
    /// Processing budget for one attempt of the stage handler.
    pub timeout_secs: u64,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_secs: 60,
            max_backoff_secs: 3600,
            timeout_secs: 300,
        }
    }
}

impl StagePolicy {
    /// Creates a policy with the given attempt cap and backoff base.
    pub fn new(max_attempts: u32, base_backoff_secs: u64) -> Self {
        Self {
            max_attempts,
            base_backoff_secs,
            ..Default::default()
        }
    }

    /// Sets the backoff cap.
    pub fn with_max_backoff_secs(mut self, secs: u64) -> Self {
        self.max_backoff_secs = secs;
        self
    }

    /// Sets the per-attempt processing budget.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Delay before re-enqueueing a task that has already failed `attempt`
    /// times before the current failure (0 for the first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let secs = self
            .base_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }

    /// Processing budget for one attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns whether a task that has failed `failures` times may run again.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    fn validate(&self, stage: Stage) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "stages.{}.max_attempts must be greater than 0",
                stage
            )));
        }
        if self.base_backoff_secs > self.max_backoff_secs {
            return Err(ConfigError::ValidationFailed(format!(
                "stages.{}.base_backoff_secs must not exceed max_backoff_secs",
                stage
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "stages.{}.timeout_secs must be greater than 0",
                stage
            )));
        }
        Ok(())
    }
}

/// Policies for all three stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicies {
    pub scrape: StagePolicy,
    pub write: StagePolicy,
    pub publish: StagePolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            scrape: StagePolicy::new(4, 60).with_timeout_secs(300),
            write: StagePolicy::new(3, 120).with_timeout_secs(600),
            publish: StagePolicy::new(6, 180).with_timeout_secs(120),
        }
    }
}

impl StagePolicies {
    /// Returns the policy for `stage`.
    pub fn get(&self, stage: Stage) -> &StagePolicy {
        match stage {
            Stage::Scrape => &self.scrape,
            Stage::Write => &self.write,
            Stage::Publish => &self.publish,
        }
    }
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-stage retry policies.
    pub stages: StagePolicies,
    /// How long a worker holds the in-flight lease of a (correlation id, stage).
    pub lease_ttl_secs: u64,
    /// Delay applied to a duplicate delivery that finds the lease taken.
    pub duplicate_delay_secs: u64,
    /// How long pipeline state records are retained.
    pub record_ttl_secs: u64,
    /// Number of recent terminal failures kept for the health report.
    pub recent_failures: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StagePolicies::default(),
            lease_ttl_secs: 900,
            duplicate_delay_secs: 30,
            record_ttl_secs: 604800, // 7 days
            recent_failures: 20,
        }
    }
}

impl PipelineConfig {
    /// Sets the policy for one stage.
    pub fn with_stage_policy(mut self, stage: Stage, policy: StagePolicy) -> Self {
        match stage {
            Stage::Scrape => self.stages.scrape = policy,
            Stage::Write => self.stages.write = policy,
            Stage::Publish => self.stages.publish = policy,
        }
        self
    }

    /// Sets the lease TTL.
    pub fn with_lease_ttl_secs(mut self, secs: u64) -> Self {
        self.lease_ttl_secs = secs;
        self
    }

    /// Sets the duplicate-delivery delay.
    pub fn with_duplicate_delay_secs(mut self, secs: u64) -> Self {
        self.duplicate_delay_secs = secs;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn duplicate_delay(&self) -> Duration {
        Duration::from_secs(self.duplicate_delay_secs)
    }

    /// Validates every stage policy and the lease settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for stage in Stage::ALL {
            self.stages.get(stage).validate(stage)?;
            if self.stages.get(stage).timeout_secs > self.lease_ttl_secs {
                return Err(ConfigError::ValidationFailed(format!(
                    "lease_ttl_secs must cover the {} stage timeout",
                    stage
                )));
            }
        }
        if self.record_ttl_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "record_ttl_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stage_policies() {
        let policies = StagePolicies::default();
        assert_eq!(policies.scrape.max_attempts, 4);
        assert_eq!(policies.write.max_attempts, 3);
        assert_eq!(policies.write.base_backoff_secs, 120);
        assert_eq!(policies.publish.max_attempts, 6);
        assert_eq!(policies.publish.base_backoff_secs, 180);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = StagePolicy::new(5, 30).with_max_backoff_secs(100);

        assert_eq!(policy.backoff(0), Duration::from_secs(30));
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(100));
        assert_eq!(policy.backoff(40), Duration::from_secs(100));
    }

    #[test]
    fn test_allows_retry() {
        let policy = StagePolicy::new(3, 1);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_validation() {
        assert!(PipelineConfig::default().validate().is_ok());

        let config =
            PipelineConfig::default().with_stage_policy(Stage::Write, StagePolicy::new(0, 10));
        assert!(config.validate().is_err());

        let config = PipelineConfig::default()
            .with_stage_policy(Stage::Scrape, StagePolicy::new(2, 500).with_max_backoff_secs(10));
        assert!(config.validate().is_err());

        let config = PipelineConfig::default().with_lease_ttl_secs(10);
        assert!(config.validate().is_err());
    }
}
