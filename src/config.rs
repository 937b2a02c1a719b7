//! Service configuration.
//!
//! [`HiveConfig`] is built once at startup and never mutated afterwards:
//!
//! 1. defaults,
//! 2. an optional YAML file,
//! 3. environment overrides,
//! 4. credential resolution from inline keys and numbered environment variables,
//! 5. validation.
//!
//! Only a validated configuration can be turned into a dispatch layer.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::adapters::ApiFlavor;
use crate::dispatch::circuit_breaker::BreakerConfig;
use crate::dispatch::credentials::CredentialPolicy;
use crate::dispatch::executor::DispatchConfig;
use crate::dispatch::provider::{Credential, Provider, TaskKind};
use crate::dispatch::rate_limiter::{RateLimitScope, RateWindowConfig};
use crate::health::HealthConfig;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::stages::StagesConfig;
use crate::scheduler::beat::ScheduleConfig;
use crate::scheduler::queue::QueueNames;
use crate::scheduler::worker_pool::WorkerConfig;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_PATH_ENV: &str = "HIVE_CONFIG";

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable or field has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The HTTP client for a provider adapter could not be built.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One external AI provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub flavor: ApiFlavor,
    pub endpoint: String,
    pub model: String,
    /// Inline API keys. Prefer `keys_env` outside of tests.
    pub keys: Vec<String>,
    /// Base name of the key variables: `{keys_env}`, `{keys_env}_1`, ...
    pub keys_env: Option<String>,
    /// Highest numbered key variable consulted.
    pub max_keys: usize,
    /// Lower values are tried first.
    pub priority: u32,
    pub weight: u32,
    pub capabilities: Vec<TaskKind>,
    /// Sliding windows; all must have room for a call to proceed.
    pub rate_limits: Vec<RateWindowConfig>,
    /// Per-call timeout override.
    pub timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Credentials resolved at load time. Never serialized.
    #[serde(skip)]
    pub resolved_keys: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            flavor: ApiFlavor::OpenAiCompatible,
            endpoint: String::new(),
            model: String::new(),
            keys: Vec::new(),
            keys_env: None,
            max_keys: 3,
            priority: 0,
            weight: 1,
            capabilities: TaskKind::ALL.to_vec(),
            rate_limits: Vec::new(),
            timeout_secs: None,
            max_tokens: Some(1024),
            temperature: Some(0.7),
            resolved_keys: Vec::new(),
        }
    }
}

impl ProviderConfig {
    pub fn new(
        name: impl Into<String>,
        flavor: ApiFlavor,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            flavor,
            endpoint: endpoint.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn groq() -> Self {
        Self::new(
            "groq",
            ApiFlavor::OpenAiCompatible,
            "https://api.groq.com/openai/v1/chat/completions",
            "llama-3.1-8b-instant",
        )
        .with_keys_env("GROQ_API_KEY")
    }

    pub fn cohere() -> Self {
        Self::new(
            "cohere",
            ApiFlavor::Cohere,
            "https://api.cohere.ai/v1/chat",
            "command-r-08-2024",
        )
        .with_keys_env("COHERE_API_KEY")
        .with_priority(1)
    }

    pub fn huggingface() -> Self {
        Self::new(
            "huggingface",
            ApiFlavor::HuggingFace,
            "https://api-inference.huggingface.co/models",
            "mistralai/Mistral-7B-Instruct-v0.2",
        )
        .with_keys_env("HUGGINGFACE_API_KEY")
        .with_priority(2)
    }

    pub fn gemini() -> Self {
        Self::new(
            "gemini",
            ApiFlavor::Gemini,
            "https://generativelanguage.googleapis.com/v1beta/models",
            "gemini-1.5-flash-latest",
        )
        .with_keys_env("GEMINI_API_KEY")
        .with_priority(3)
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_keys_env(mut self, var: impl Into<String>) -> Self {
        self.keys_env = Some(var.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rate_limits(mut self, limits: Vec<RateWindowConfig>) -> Self {
        self.rate_limits = limits;
        self
    }

    /// Collects keys from `keys`, `{keys_env}_1..=max_keys` and `{keys_env}`,
    /// dropping blanks and duplicates while keeping first-seen order.
    pub fn resolve_keys<F>(&self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut candidates: Vec<String> = self.keys.clone();
        if let Some(base) = &self.keys_env {
            for n in 1..=self.max_keys {
                if let Some(value) = lookup(&format!("{}_{}", base, n)) {
                    candidates.push(value);
                }
            }
            if let Some(value) = lookup(base) {
                candidates.push(value);
            }
        }

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .collect()
    }

    /// Static provider description for the dispatch layer.
    pub fn provider(&self) -> Provider {
        Provider::new(&self.name, &self.endpoint, &self.model)
            .with_priority(self.priority)
            .with_weight(self.weight)
            .with_capabilities(self.capabilities.clone())
    }

    /// Resolved credentials bound to this provider.
    pub fn credentials(&self) -> Vec<Credential> {
        self.resolved_keys
            .iter()
            .enumerate()
            .map(|(i, key)| Credential::new(&self.name, i, key.clone()))
            .collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Applies `{NAME}_RATE_LIMIT_PER_{MINUTE,HOUR,DAY}` overrides.
    fn apply_rate_limit_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = self.name.to_uppercase().replace('-', "_");
        for (suffix, window_secs) in [("MINUTE", 60), ("HOUR", 3_600), ("DAY", 86_400)] {
            let key = format!("{}_RATE_LIMIT_PER_{}", prefix, suffix);
            let Some(value) = lookup(&key) else {
                continue;
            };
            let capacity: u32 = parse_env_value(&value, &key)?;
            self.rate_limits.retain(|w| w.window_secs != window_secs);
            self.rate_limits.push(RateWindowConfig::new(capacity, window_secs));
        }
        self.rate_limits.sort_by_key(|w| w.window_secs);
        Ok(())
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub redis_url: String,
    pub providers: Vec<ProviderConfig>,
    pub credentials: CredentialPolicy,
    pub rate_limit_scope: RateLimitScope,
    pub breaker: BreakerConfig,
    pub dispatch: DispatchConfig,
    pub pipeline: PipelineConfig,
    pub stages: StagesConfig,
    pub queues: QueueNames,
    pub schedule: ScheduleConfig,
    pub workers: WorkerConfig,
    pub health: HealthConfig,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            providers: vec![
                ProviderConfig::groq(),
                ProviderConfig::cohere(),
                ProviderConfig::huggingface(),
                ProviderConfig::gemini(),
            ],
            credentials: CredentialPolicy::default(),
            rate_limit_scope: RateLimitScope::Provider,
            breaker: BreakerConfig::default(),
            dispatch: DispatchConfig::default(),
            pipeline: PipelineConfig::default(),
            stages: StagesConfig::default(),
            queues: QueueNames::default(),
            schedule: ScheduleConfig::default(),
            workers: WorkerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl HiveConfig {
    /// Loads configuration from an optional file plus the process environment.
    ///
    /// The file path is `path`, else `$HIVE_CONFIG`, else defaults only.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// override is malformed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok();
        let path = path.or(env_path.as_deref().map(Path::new));
        let base = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        base.resolve(|key| std::env::var(key).ok())
    }

    /// Parses a YAML file without applying overrides.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Applies environment overrides, resolves credentials and validates.
    ///
    /// `lookup` abstracts the environment so tests stay hermetic.
    pub fn resolve<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.apply_env(&lookup)?;
        for provider in &mut self.providers {
            provider.apply_rate_limit_env(&lookup)?;
            provider.resolved_keys = provider.resolve_keys(&lookup);
            tracing::debug!(
                provider = %provider.name,
                credentials = provider.resolved_keys.len(),
                "Resolved provider credentials"
            );
        }
        self.validate()?;
        Ok(self)
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("HIVE_REDIS_URL") {
            self.redis_url = val;
        }

        if let Some(val) = lookup("HIVE_SCHEDULE_INTERVAL_SECS") {
            self.schedule.interval_secs = parse_env_value(&val, "HIVE_SCHEDULE_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("HIVE_SCHEDULE_ENABLED") {
            self.schedule.enabled = parse_env_bool(&val, "HIVE_SCHEDULE_ENABLED")?;
        }

        if let Some(val) = lookup("HIVE_CALL_TIMEOUT_SECS") {
            self.dispatch.call_timeout_secs = parse_env_value(&val, "HIVE_CALL_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("HIVE_MAX_DISPATCH_ATTEMPTS") {
            self.dispatch.max_attempts = Some(parse_env_value(&val, "HIVE_MAX_DISPATCH_ATTEMPTS")?);
        }

        if let Some(val) = lookup("HIVE_WORKERS_PER_QUEUE") {
            self.workers.workers_per_queue = parse_env_value(&val, "HIVE_WORKERS_PER_QUEUE")?;
        }

        if let Some(val) = lookup("HIVE_ALERT_FAILURE_RATE") {
            self.health.alert_failure_rate = parse_env_value(&val, "HIVE_ALERT_FAILURE_RATE")?;
        }

        if let Some(val) = lookup("HIVE_PUBLISH_WEBHOOK_URL") {
            self.stages.publisher.webhook_url = Some(val);
        }

        Ok(())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.providers.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one provider must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "provider name cannot be empty".to_string(),
                ));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.endpoint.is_empty() || provider.model.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "provider '{}' needs an endpoint and a model",
                    provider.name
                )));
            }
            if provider.capabilities.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "provider '{}' has no capabilities",
                    provider.name
                )));
            }
            if provider
                .rate_limits
                .iter()
                .any(|w| w.capacity == 0 || w.window_secs == 0)
            {
                return Err(ConfigError::ValidationFailed(format!(
                    "provider '{}' has a rate window with zero capacity or length",
                    provider.name
                )));
            }
            if provider.timeout_secs == Some(0) {
                return Err(ConfigError::ValidationFailed(format!(
                    "provider '{}' timeout must be greater than 0",
                    provider.name
                )));
            }
        }

        if self.providers.iter().all(|p| p.resolved_keys.is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "no provider has a credential; set keys or the provider's key variables"
                    .to_string(),
            ));
        }

        if self.credentials.failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "credentials.failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.credentials.base_cooldown_secs > self.credentials.max_cooldown_secs {
            return Err(ConfigError::ValidationFailed(
                "credentials.base_cooldown_secs cannot exceed max_cooldown_secs".to_string(),
            ));
        }

        if self.breaker.failure_threshold == 0 || self.breaker.window_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker.failure_threshold and breaker.window_secs must be greater than 0"
                    .to_string(),
            ));
        }

        if self.breaker.base_cooldown_secs > self.breaker.max_cooldown_secs {
            return Err(ConfigError::ValidationFailed(
                "breaker.base_cooldown_secs cannot exceed max_cooldown_secs".to_string(),
            ));
        }

        if self.dispatch.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "dispatch.call_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.dispatch.max_attempts == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.schedule.interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "schedule.interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.workers.workers_per_queue == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers.workers_per_queue must be greater than 0".to_string(),
            ));
        }

        self.queues.validate()?;
        self.pipeline.validate()?;

        Ok(())
    }

    /// Total resolved credentials across providers.
    pub fn credential_count(&self) -> usize {
        self.providers.iter().map(|p| p.resolved_keys.len()).sum()
    }

    pub fn with_providers(mut self, providers: Vec<ProviderConfig>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }
}

/// Parse an environment variable value.
pub(crate) fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a boolean environment variable value.
pub(crate) fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_require_a_credential() {
        let result = HiveConfig::default().resolve(env(&[]));
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_numbered_keys_resolved_and_deduplicated() {
        let config = HiveConfig::default()
            .resolve(env(&[
                ("GROQ_API_KEY_1", "gsk-one"),
                ("GROQ_API_KEY_2", " gsk-two "),
                ("GROQ_API_KEY_3", ""),
                ("GROQ_API_KEY", "gsk-one"),
                ("COHERE_API_KEY", "co-key"),
            ]))
            .expect("config should resolve");

        let groq = &config.providers[0];
        assert_eq!(groq.resolved_keys, vec!["gsk-one", "gsk-two"]);
        assert_eq!(groq.credentials()[1].id.to_string(), "groq#1");
        assert_eq!(config.credential_count(), 3);
    }

    #[test]
    fn test_env_overrides() {
        let config = HiveConfig::default()
            .resolve(env(&[
                ("GROQ_API_KEY", "k"),
                ("HIVE_REDIS_URL", "redis://cache:6379"),
                ("HIVE_SCHEDULE_INTERVAL_SECS", "600"),
                ("HIVE_MAX_DISPATCH_ATTEMPTS", "5"),
                ("HIVE_SCHEDULE_ENABLED", "off"),
                ("GROQ_RATE_LIMIT_PER_MINUTE", "30"),
                ("GROQ_RATE_LIMIT_PER_DAY", "14400"),
            ]))
            .expect("config should resolve");

        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.schedule.interval_secs, 600);
        assert!(!config.schedule.enabled);
        assert_eq!(config.dispatch.max_attempts, Some(5));
        assert_eq!(
            config.providers[0].rate_limits,
            vec![RateWindowConfig::per_minute(30), RateWindowConfig::per_day(14_400)]
        );
    }

    #[test]
    fn test_invalid_env_value() {
        let result = HiveConfig::default().resolve(env(&[
            ("GROQ_API_KEY", "k"),
            ("HIVE_WORKERS_PER_QUEUE", "many"),
        ]));
        match result {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "HIVE_WORKERS_PER_QUEUE"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_provider_names_rejected() {
        let config = HiveConfig::default().with_providers(vec![
            ProviderConfig::groq().with_keys(vec!["a".to_string()]),
            ProviderConfig::groq(),
        ]);
        let result = config.resolve(env(&[]));
        assert!(matches!(result, Err(ConfigError::ValidationFailed(m)) if m.contains("duplicate")));
    }

    #[test]
    fn test_empty_provider_list_rejected() {
        let result = HiveConfig::default().with_providers(Vec::new()).resolve(env(&[]));
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
redis_url: redis://queue:6379
rate_limit_scope: credential
providers:
  - name: local
    flavor: open_ai_compatible
    endpoint: http://localhost:8000/v1/chat/completions
    model: tiny
    keys: [k1, k2]
    rate_limits:
      - capacity: 10
        window_secs: 60
breaker:
  failure_threshold: 3
dispatch:
  call_timeout_secs: 15
  strategy:
    type: weighted_random
    seed: 7
schedule:
  interval_secs: 900
"#
        )
        .expect("write config");

        let config = HiveConfig::from_yaml_file(file.path())
            .expect("yaml should parse")
            .resolve(env(&[]))
            .expect("config should validate");

        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].resolved_keys.len(), 2);
        assert_eq!(config.rate_limit_scope, RateLimitScope::Credential);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.window_secs, 60);
        assert_eq!(config.dispatch.call_timeout_secs, 15);
        assert_eq!(config.schedule.interval_secs, 900);
        assert_eq!(config.queues, QueueNames::default());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("YES", "K").expect("valid"));
        assert!(!parse_env_bool("0", "K").expect("valid"));
        assert!(parse_env_bool("maybe", "K").is_err());
    }
}
