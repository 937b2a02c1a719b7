//! Dispatch executor.
//!
//! Runs one generation request against the provider fleet: asks the router
//! for a (provider, credential) pair, calls the provider adapter under a hard
//! timeout, classifies the result and feeds it back into the breaker, the
//! credential pool and the rate limiter. Retryable failures loop back to the
//! router until the attempt budget is spent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{to_chrono, SharedClock};
use crate::error::{DispatchError, ProviderError};
use crate::metrics::MetricsCollector;

use super::circuit_breaker::{Admission, CircuitState};
use super::outcome::{DispatchAttempt, Outcome};
use super::provider::{
    CredentialId, GenerationRequest, GenerationResponse, Provider, ProviderAdapter, TaskKind,
};
use super::router::{ProviderRouter, RoutingStrategy};
use super::stats::{ProviderStats, ProviderUsage};

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Hard timeout of a single provider call, unless the adapter sets its own.
    pub call_timeout_secs: u64,
    /// Attempts per request. `None` means one per configured credential of
    /// the capable providers.
    pub max_attempts: Option<usize>,
    /// Ordering of equal-priority providers.
    pub strategy: RoutingStrategy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            max_attempts: None,
            strategy: RoutingStrategy::Priority,
        }
    }
}

impl DispatchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn with_call_timeout_secs(mut self, secs: u64) -> Self {
        self.call_timeout_secs = secs;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// A successful dispatch and the attempts it took.
#[derive(Debug, Clone)]
pub struct DispatchSuccess {
    pub response: GenerationResponse,
    pub provider: String,
    pub credential: CredentialId,
    /// Every attempt made, the successful one last.
    pub attempts: Vec<DispatchAttempt>,
}

/// Executes generation requests with provider failover.
pub struct DispatchExecutor {
    providers: Vec<Arc<Provider>>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    router: Arc<ProviderRouter>,
    config: DispatchConfig,
    clock: SharedClock,
    stats: ProviderStats,
    metrics: MetricsCollector,
}

impl DispatchExecutor {
    /// Creates an executor over `providers`, each paired with its adapter.
    pub fn new(
        router: Arc<ProviderRouter>,
        providers: Vec<(Provider, Arc<dyn ProviderAdapter>)>,
        config: DispatchConfig,
        clock: SharedClock,
    ) -> Self {
        let stats = ProviderStats::new(providers.iter().map(|(p, _)| p.name.as_str()));
        let mut adapters = HashMap::new();
        let mut registered = Vec::with_capacity(providers.len());
        for (provider, adapter) in providers {
            adapters.insert(provider.name.clone(), adapter);
            registered.push(Arc::new(provider));
        }

        Self {
            providers: registered,
            adapters,
            router,
            config,
            clock,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Live call counters for `provider`.
    pub fn usage(&self, provider: &str) -> ProviderUsage {
        self.stats.usage(provider)
    }

    /// Forces a provider's circuit back to closed.
    pub fn reset_breaker(&self, provider: &str) {
        self.router.breaker().reset(provider);
        self.metrics
            .update_circuit_state(provider, CircuitState::Closed.as_gauge());
        info!(provider = %provider, "Circuit manually reset");
    }

    /// Runs `request` against the capable providers until one succeeds.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NoCapableProvider`] if no provider supports the task kind
    /// - [`DispatchError::PermanentCallFailure`] if every attempt failed permanently
    ///   and no other candidate is left
    /// - [`DispatchError::AllCandidatesExhausted`] otherwise
    pub async fn execute(
        &self,
        request: &GenerationRequest,
    ) -> Result<DispatchSuccess, DispatchError> {
        let candidates = self.candidates(request.kind);
        if candidates.is_empty() {
            let err = DispatchError::NoCapableProvider(request.kind);
            self.metrics
                .record_dispatch_failure(request.kind.as_str(), "no_capable_provider");
            return Err(err);
        }

        let budget = self.attempt_budget(&candidates);
        let mut attempts: Vec<DispatchAttempt> = Vec::new();
        let mut last_error: Option<DispatchError> = None;

        for _ in 0..budget {
            let selection = match self.router.select(&candidates) {
                Ok(selection) => selection,
                Err(exhausted) => {
                    debug!(
                        task_kind = %request.kind,
                        skipped = exhausted.skipped.len(),
                        "Router found no usable candidate"
                    );
                    let recoverable = exhausted.is_recoverable();
                    return Err(self.fail(request.kind, &attempts, last_error, recoverable));
                }
            };

            let provider = Arc::clone(&selection.provider);
            // Candidates are filtered on registered adapters, so this only
            // fires if that filter and the adapter map ever disagree.
            let Some(adapter) = self.adapters.get(&provider.name) else {
                warn!(provider = %provider.name, "Selected provider has no adapter");
                self.router.release(selection);
                continue;
            };
            let admission = selection.admission;
            let credential = selection.credential;
            let call_timeout = adapter.timeout().unwrap_or_else(|| self.config.call_timeout());

            debug!(
                provider = %provider.name,
                credential = %credential.id,
                fingerprint = %credential.secret.fingerprint(),
                trial = admission.is_trial(),
                "Dispatching provider call"
            );

            let started_at = self.clock.now();
            let started = Instant::now();
            let result = match tokio::time::timeout(call_timeout, adapter.invoke(&credential, request)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(call_timeout)),
            };
            let latency = started.elapsed();
            let outcome = match &result {
                Ok(_) => Outcome::Success,
                Err(e) => e.outcome(),
            };

            self.record(&provider.name, &credential.id, admission, outcome, latency, &result);
            attempts.push(DispatchAttempt {
                provider: provider.name.clone(),
                credential: credential.id.clone(),
                started_at,
                latency,
                outcome,
                error: result.as_ref().err().map(ToString::to_string),
            });

            match result {
                Ok(response) => {
                    if attempts.len() > 1 {
                        info!(
                            provider = %provider.name,
                            task_kind = %request.kind,
                            attempts = attempts.len(),
                            "Dispatch succeeded after failover"
                        );
                    }
                    return Ok(DispatchSuccess {
                        response,
                        provider: provider.name.clone(),
                        credential: credential.id,
                        attempts,
                    });
                }
                Err(err) => {
                    warn!(
                        provider = %provider.name,
                        credential = %credential.id,
                        outcome = %outcome,
                        latency_ms = latency.as_millis() as u64,
                        error = %err,
                        "Provider call failed"
                    );
                    last_error = Some(classify(&provider.name, &credential.id, outcome, err));
                }
            }
        }

        // Permanent errors are final only once no candidate has a usable credential left.
        let recoverable =
            !all_permanent(&attempts) || self.router.has_enabled_candidate(&candidates);
        Err(self.fail(request.kind, &attempts, last_error, recoverable))
    }

    /// Capable providers in configuration order.
    fn candidates(&self, kind: TaskKind) -> Vec<Arc<Provider>> {
        self.providers
            .iter()
            .filter(|p| p.supports(kind) && self.adapters.contains_key(&p.name))
            .cloned()
            .collect()
    }

    fn attempt_budget(&self, candidates: &[Arc<Provider>]) -> usize {
        self.config
            .max_attempts
            .unwrap_or_else(|| {
                candidates
                    .iter()
                    .map(|p| self.router.pool().total(&p.name))
                    .sum()
            })
            .max(1)
    }

    /// Feeds one classified outcome into every shared store.
    fn record(
        &self,
        provider: &str,
        credential: &CredentialId,
        admission: Admission,
        outcome: Outcome,
        latency: Duration,
        result: &Result<GenerationResponse, ProviderError>,
    ) {
        self.router
            .breaker()
            .report_admitted(provider, admission, outcome);
        self.router.pool().report(credential, outcome);
        if let Some(retry_after) = result.as_ref().err().and_then(ProviderError::retry_after) {
            let until = self.clock.now() + to_chrono(retry_after);
            self.router.limiter().block_until(credential, until);
            debug!(
                credential = %credential,
                retry_after_secs = retry_after.as_secs(),
                "Provider sent throttling hint"
            );
        }

        self.stats.record(provider, outcome);
        self.metrics
            .record_dispatch_attempt(provider, outcome.as_str(), latency);
        self.metrics
            .update_circuit_state(provider, self.router.breaker().state(provider).as_gauge());
        self.metrics
            .update_credentials_available(provider, self.router.pool().available(provider));
    }

    /// Builds the terminal error for a request that produced no response.
    fn fail(
        &self,
        kind: TaskKind,
        attempts: &[DispatchAttempt],
        last_error: Option<DispatchError>,
        recoverable: bool,
    ) -> DispatchError {
        let err = match last_error {
            Some(permanent @ DispatchError::PermanentCallFailure { .. })
                if !recoverable && all_permanent(attempts) =>
            {
                permanent
            }
            last_error => DispatchError::AllCandidatesExhausted {
                task_kind: kind,
                attempts: attempts.len(),
                last_error: last_error.map(|e| e.to_string()),
                recoverable,
            },
        };

        let label = match &err {
            DispatchError::PermanentCallFailure { .. } => "permanent",
            _ if recoverable => "exhausted",
            _ => "exhausted_unrecoverable",
        };
        self.metrics.record_dispatch_failure(kind.as_str(), label);
        warn!(
            task_kind = %kind,
            attempts = attempts.len(),
            recoverable = recoverable,
            error = %err,
            "Dispatch failed"
        );
        err
    }
}

fn all_permanent(attempts: &[DispatchAttempt]) -> bool {
    !attempts.is_empty()
        && attempts
            .iter()
            .all(|a| a.outcome == Outcome::PermanentError)
}

fn classify(
    provider: &str,
    credential: &CredentialId,
    outcome: Outcome,
    err: ProviderError,
) -> DispatchError {
    if outcome == Outcome::PermanentError {
        DispatchError::PermanentCallFailure {
            provider: provider.to_string(),
            credential: credential.to_string(),
            message: err.to_string(),
        }
    } else {
        DispatchError::TransientCallFailure {
            provider: provider.to_string(),
            credential: credential.to_string(),
            outcome,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatch::circuit_breaker::{BreakerConfig, CircuitBreaker};
    use crate::dispatch::credentials::{CredentialPolicy, CredentialPool};
    use crate::dispatch::provider::Credential;
    use crate::dispatch::rate_limiter::{RateLimitScope, RateLimiter};

    /// Adapter that replays scripted results, then succeeds.
    struct Scripted {
        script: Mutex<VecDeque<Result<GenerationResponse, ProviderError>>>,
        calls: Mutex<Vec<CredentialId>>,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn new(script: Vec<Result<GenerationResponse, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                delay: Some(delay),
            })
        }

        fn calls(&self) -> Vec<CredentialId> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        async fn invoke(
            &self,
            credential: &Credential,
            _request: &GenerationRequest,
        ) -> Result<GenerationResponse, ProviderError> {
            self.calls.lock().expect("lock").push(credential.id.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().expect("lock").pop_front();
            next.unwrap_or_else(|| Ok(GenerationResponse::new(format!("ok from {}", credential.id))))
        }
    }

    fn executor(
        specs: Vec<(&str, usize, Arc<Scripted>)>,
        config: DispatchConfig,
    ) -> (DispatchExecutor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let shared: SharedClock = clock.clone();
        let credentials = specs
            .iter()
            .flat_map(|(name, keys, _)| {
                (0..*keys).map(move |i| Credential::new(*name, i, format!("key-{}-{}", name, i)))
            })
            .collect();
        let router = Arc::new(ProviderRouter::new(
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), shared.clone())),
            Arc::new(RateLimiter::new(
                RateLimitScope::Provider,
                HashMap::new(),
                shared.clone(),
            )),
            Arc::new(CredentialPool::new(
                CredentialPolicy::default(),
                credentials,
                shared.clone(),
            )),
            RoutingStrategy::Priority,
        ));
        let providers = specs
            .into_iter()
            .enumerate()
            .map(|(i, (name, _, adapter))| {
                let adapter: Arc<dyn ProviderAdapter> = adapter;
                (
                    Provider::new(name, "http://localhost", "model").with_priority(i as u32),
                    adapter,
                )
            })
            .collect();
        (
            DispatchExecutor::new(router, providers, config, shared),
            clock,
        )
    }

    fn request() -> GenerationRequest {
        GenerationRequest::prompt(TaskKind::Write, "write about rust")
    }

    #[tokio::test]
    async fn test_success_on_first_candidate() {
        let a = Scripted::new(vec![]);
        let (exec, _) = executor(vec![("a", 1, a.clone())], DispatchConfig::default());

        let success = exec.execute(&request()).await.expect("dispatch should succeed");
        assert_eq!(success.provider, "a");
        assert_eq!(success.attempts.len(), 1);
        assert_eq!(success.attempts[0].outcome, Outcome::Success);
        assert_eq!(exec.usage("a").successes, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_within_budget() {
        let a = Scripted::new(vec![Err(ProviderError::Transient("HTTP 503".to_string()))]);
        let b = Scripted::new(vec![]);
        let (exec, _) = executor(
            vec![("a", 1, a.clone()), ("b", 1, b.clone())],
            DispatchConfig::default().with_max_attempts(3),
        );

        // "a" is below its failure threshold, so the router retries it first.
        let success = exec.execute(&request()).await.expect("dispatch should succeed");
        assert_eq!(success.attempts.len(), 2);
        assert_eq!(success.attempts[0].outcome, Outcome::TransientError);
        assert_eq!(a.calls().len(), 2);
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_error_disables_credential_and_moves_on() {
        let a = Scripted::new(vec![Err(ProviderError::Permanent {
            status: 401,
            message: "invalid api key".to_string(),
        })]);
        let b = Scripted::new(vec![]);
        let (exec, _) = executor(
            vec![("a", 1, a.clone()), ("b", 1, b.clone())],
            DispatchConfig::default(),
        );

        let success = exec.execute(&request()).await.expect("dispatch should succeed");
        assert_eq!(success.provider, "b");
        assert_eq!(exec.router().pool().available("a"), 0);

        // The disabled credential is never chosen again.
        exec.execute(&request()).await.expect("dispatch should succeed");
        assert_eq!(a.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_on_every_candidate() {
        let permanent = || {
            Err(ProviderError::Permanent {
                status: 403,
                message: "forbidden".to_string(),
            })
        };
        let a = Scripted::new(vec![permanent()]);
        let b = Scripted::new(vec![permanent()]);
        let (exec, _) = executor(vec![("a", 1, a), ("b", 1, b)], DispatchConfig::default());

        let err = exec.execute(&request()).await.expect_err("dispatch should fail");
        assert!(matches!(err, DispatchError::PermanentCallFailure { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_permanent_error_with_untried_candidate_stays_retryable() {
        let a = Scripted::new(vec![Err(ProviderError::Permanent {
            status: 401,
            message: "bad key".to_string(),
        })]);
        let b = Scripted::new(vec![]);
        let (exec, _) = executor(
            vec![("a", 1, a.clone()), ("b", 1, b.clone())],
            DispatchConfig::default().with_max_attempts(1),
        );

        let err = exec.execute(&request()).await.expect_err("budget spent on a");
        assert!(matches!(
            err,
            DispatchError::AllCandidatesExhausted { attempts: 1, recoverable: true, .. }
        ));
        assert!(err.is_retryable());
        assert!(b.calls().is_empty());

        let success = exec.execute(&request()).await.expect("b serves the retry");
        assert_eq!(success.provider, "b");
        assert_eq!(a.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_trial_success_closes_circuit() {
        let a = Scripted::new(vec![]);
        let (exec, clock) = executor(vec![("a", 1, a.clone())], DispatchConfig::default());
        let breaker = exec.router().breaker();
        for _ in 0..5 {
            breaker.report("a", Outcome::TransientError);
        }
        clock.advance(Duration::from_secs(60));

        exec.execute(&request()).await.expect("trial call succeeds");
        assert_eq!(breaker.state("a"), CircuitState::Closed);
        assert_eq!(a.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_recoverable_after_transient_failures() {
        let transient = || Err(ProviderError::Transient("connection reset".to_string()));
        let a = Scripted::new(vec![transient(), transient(), transient(), transient()]);
        let (exec, _) = executor(vec![("a", 1, a.clone())], DispatchConfig::default().with_max_attempts(10));

        let err = exec.execute(&request()).await.expect_err("dispatch should fail");
        match err {
            DispatchError::AllCandidatesExhausted {
                attempts,
                recoverable,
                last_error,
                ..
            } => {
                // Three failures put the only credential on cooldown.
                assert_eq!(attempts, 3);
                assert!(recoverable);
                assert!(last_error.is_some_and(|e| e.contains("connection reset")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let slow = Scripted::slow(Duration::from_millis(200));
        let (exec, _) = executor(
            vec![("a", 1, slow)],
            DispatchConfig {
                call_timeout_secs: 0,
                max_attempts: Some(1),
                ..Default::default()
            },
        );

        let err = exec.execute(&request()).await.expect_err("call should time out");
        assert!(err.is_retryable());
        assert_eq!(exec.usage("a").timeouts, 1);
    }

    #[tokio::test]
    async fn test_retry_after_blocks_provider() {
        let a = Scripted::new(vec![Err(ProviderError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        })]);
        let b = Scripted::new(vec![]);
        let (exec, clock) = executor(
            vec![("a", 2, a.clone()), ("b", 1, b.clone())],
            DispatchConfig::default(),
        );

        let success = exec.execute(&request()).await.expect("dispatch should succeed");
        assert_eq!(success.provider, "b");
        assert_eq!(a.calls().len(), 1);

        clock.advance(Duration::from_secs(30));
        let success = exec.execute(&request()).await.expect("dispatch should succeed");
        assert_eq!(success.provider, "a");
    }

    #[tokio::test]
    async fn test_no_capable_provider() {
        let (exec, _) = executor(vec![("a", 1, Scripted::new(vec![]))], DispatchConfig::default());
        let exec = DispatchExecutor::new(
            Arc::clone(exec.router()),
            Vec::new(),
            DispatchConfig::default(),
            Arc::new(ManualClock::starting_now()),
        );

        let err = exec.execute(&request()).await.expect_err("no providers");
        assert!(matches!(err, DispatchError::NoCapableProvider(TaskKind::Write)));
    }

    #[tokio::test]
    async fn test_capabilities_filter_candidates() {
        let a = Scripted::new(vec![]);
        let b = Scripted::new(vec![]);
        let (exec, _) = executor(vec![("a", 1, a.clone()), ("b", 1, b)], DispatchConfig::default());
        let headline_only = Provider::new("h", "http://localhost", "model")
            .with_capabilities(vec![TaskKind::Headline]);
        let adapter: Arc<dyn ProviderAdapter> = a;
        let exec = DispatchExecutor::new(
            Arc::clone(exec.router()),
            vec![(headline_only, adapter)],
            DispatchConfig::default(),
            Arc::new(ManualClock::starting_now()),
        );

        let err = exec.execute(&request()).await.expect_err("no writer");
        assert!(matches!(err, DispatchError::NoCapableProvider(TaskKind::Write)));
    }
}
