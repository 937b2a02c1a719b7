//! Resilient multi-provider dispatch layer.
//!
//! Every outbound call to an AI provider goes through this module:
//!
//! - [`CredentialPool`]: per-credential rotation, cooldown and disabling
//! - [`RateLimiter`]: non-blocking sliding windows per provider or credential
//! - [`CircuitBreaker`]: per-provider closed/open/half-open state machine
//! - [`ProviderRouter`]: picks the next usable (provider, credential) pair
//! - [`DispatchExecutor`]: calls the adapter, classifies, feeds state back
//!
//! All shared state is owned by these instances and handed to workers by
//! `Arc`; nothing lives in globals.
//!
//! # Example
//!
//! ```ignore
//! use hive_forge::config::HiveConfig;
//! use hive_forge::dispatch::{build_executor, GenerationRequest, TaskKind};
//!
//! let config = HiveConfig::load(None)?;
//! let executor = build_executor(&config, hive_forge::clock::system_clock())?;
//! let result = executor
//!     .execute(&GenerationRequest::prompt(TaskKind::Write, "Explain sliding windows"))
//!     .await?;
//! println!("{} answered: {}", result.provider, result.response.text);
//! ```

pub mod adapters;
pub mod circuit_breaker;
pub mod credentials;
pub mod executor;
pub mod outcome;
pub mod provider;
pub mod rate_limiter;
pub mod router;
pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

pub use adapters::{ApiFlavor, HttpAdapter};
pub use circuit_breaker::{Admission, BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use credentials::{CredentialPolicy, CredentialPool, CredentialStatus};
pub use executor::{DispatchConfig, DispatchExecutor, DispatchSuccess};
pub use outcome::{DispatchAttempt, Outcome};
pub use provider::{
    Credential, CredentialId, GenerationRequest, GenerationResponse, Message, Provider,
    ProviderAdapter, Secret, TaskKind,
};
pub use rate_limiter::{RateLimitScope, RateLimiter, RateSlot, RateWindowConfig, WindowUsage};
pub use router::{ExhaustedError, ProviderRouter, RoutingStrategy, Selection};
pub use stats::{ProviderStats, ProviderUsage};

use crate::clock::SharedClock;
use crate::config::{ConfigError, HiveConfig};

/// Builds the full dispatch layer with HTTP adapters from a validated config.
///
/// Providers without any resolved credential are left out.
///
/// # Errors
///
/// Returns `ConfigError` if an HTTP client cannot be built or no provider
/// is left.
pub fn build_executor(
    config: &HiveConfig,
    clock: SharedClock,
) -> Result<DispatchExecutor, ConfigError> {
    let mut providers: Vec<(Provider, Arc<dyn ProviderAdapter>)> = Vec::new();
    let mut credentials = Vec::new();
    let mut limits = HashMap::new();

    for provider_config in &config.providers {
        if provider_config.resolved_keys.is_empty() {
            warn!(provider = %provider_config.name, "Provider has no credentials, skipping");
            continue;
        }

        let mut adapter = HttpAdapter::new(
            provider_config.flavor,
            &provider_config.endpoint,
            &provider_config.model,
        )?
        .with_defaults(provider_config.max_tokens, provider_config.temperature);
        if let Some(timeout) = provider_config.timeout() {
            adapter = adapter.with_timeout(timeout);
        }

        credentials.extend(provider_config.credentials());
        if !provider_config.rate_limits.is_empty() {
            limits.insert(provider_config.name.clone(), provider_config.rate_limits.clone());
        }
        providers.push((provider_config.provider(), Arc::new(adapter)));
    }

    if providers.is_empty() {
        return Err(ConfigError::ValidationFailed(
            "no provider has a credential".to_string(),
        ));
    }

    info!(
        providers = providers.len(),
        credentials = credentials.len(),
        scope = ?config.rate_limit_scope,
        "Dispatch layer configured"
    );

    let router = ProviderRouter::new(
        Arc::new(CircuitBreaker::new(config.breaker.clone(), clock.clone())),
        Arc::new(RateLimiter::new(config.rate_limit_scope, limits, clock.clone())),
        Arc::new(CredentialPool::new(
            config.credentials.clone(),
            credentials,
            clock.clone(),
        )),
        config.dispatch.strategy.clone(),
    );

    Ok(DispatchExecutor::new(
        Arc::new(router),
        providers,
        config.dispatch.clone(),
        clock,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::config::ProviderConfig;

    #[test]
    fn test_build_executor_skips_providers_without_keys() {
        let config = HiveConfig::default()
            .with_providers(vec![
                ProviderConfig::groq().with_keys(vec!["gsk-a".to_string(), "gsk-b".to_string()]),
                ProviderConfig::cohere(),
            ])
            .resolve(|_| None)
            .expect("config should validate");

        let executor = build_executor(&config, system_clock()).expect("executor should build");
        assert_eq!(executor.providers().len(), 1);
        assert_eq!(executor.router().pool().total("groq"), 2);
        assert_eq!(executor.router().pool().total("cohere"), 0);
    }
}
