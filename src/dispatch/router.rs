//! Provider router.
//!
//! Composes the circuit breaker, rate limiter and credential pool to pick
//! the next usable (provider, credential) pair. Candidates are visited in
//! priority order; for each one the breaker is consulted first, then the
//! rate limiter, then the pool. If nothing is usable the router returns
//! [`ExhaustedError`], which callers turn into a stage-level retry.
//!
//! Ordering within a priority level is stable by default. Round-robin and
//! weighted-random strategies spread load across equal-priority providers;
//! the random strategy is seeded so runs are reproducible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::{DispatchError, UnavailableReason};

use super::circuit_breaker::{Admission, CircuitBreaker};
use super::credentials::CredentialPool;
use super::provider::{Credential, Provider};
use super::rate_limiter::{RateLimiter, RateSlot};

/// How providers with equal priority are ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Configuration order.
    #[default]
    Priority,
    /// Rotate the starting provider on every selection.
    RoundRobin,
    /// Weighted shuffle driven by a seeded generator.
    WeightedRandom { seed: u64 },
}

/// A usable (provider, credential) pair.
#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: Arc<Provider>,
    pub credential: Credential,
    /// How the provider's circuit let the call through.
    pub admission: Admission,
    /// Rate window entries taken for the call.
    slots: Vec<RateSlot>,
}

/// No candidate yielded a usable pair.
#[derive(Debug, Clone, Error)]
#[error("No usable provider among {} candidates", .skipped.len())]
pub struct ExhaustedError {
    /// One `ProviderUnavailable` entry per skipped candidate.
    pub skipped: Vec<DispatchError>,
}

impl ExhaustedError {
    /// Returns whether waiting could make any candidate usable again.
    pub fn is_recoverable(&self) -> bool {
        self.skipped.iter().any(DispatchError::is_retryable)
    }
}

/// Picks the next usable (provider, credential) pair.
pub struct ProviderRouter {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    pool: Arc<CredentialPool>,
    strategy: RoutingStrategy,
    round_robin_counter: AtomicUsize,
    rng: Mutex<ChaCha8Rng>,
}

impl ProviderRouter {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        pool: Arc<CredentialPool>,
        strategy: RoutingStrategy,
    ) -> Self {
        let seed = match strategy {
            RoutingStrategy::WeightedRandom { seed } => seed,
            _ => 0,
        };
        Self {
            breaker,
            limiter,
            pool,
            strategy,
            round_robin_counter: AtomicUsize::new(0),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn strategy(&self) -> &RoutingStrategy {
        &self.strategy
    }

    /// Returns the first usable (provider, credential) pair among `candidates`.
    pub fn select(&self, candidates: &[Arc<Provider>]) -> Result<Selection, ExhaustedError> {
        let mut skipped = Vec::new();

        for provider in self.order(candidates) {
            let name = provider.name.as_str();

            let Some(admission) = self.breaker.admit(name) else {
                debug!(provider = %name, "Skipping provider: circuit open");
                skipped.push(unavailable(name, UnavailableReason::CircuitOpen));
                continue;
            };

            let Some(provider_slot) = self.limiter.try_acquire(name) else {
                debug!(provider = %name, "Skipping provider: rate window full");
                self.breaker.release_trial(name, admission);
                skipped.push(unavailable(name, UnavailableReason::RateLimited));
                continue;
            };

            let mut credential_slot = None;
            let acquired = self.pool.acquire_where(name, |c| {
                credential_slot = self.limiter.try_acquire_credential(&c.id);
                credential_slot.is_some()
            });
            match acquired {
                Ok(credential) => {
                    return Ok(Selection {
                        provider,
                        credential,
                        admission,
                        slots: std::iter::once(provider_slot).chain(credential_slot).collect(),
                    });
                }
                Err(reason) => {
                    debug!(provider = %name, reason = %reason, "Skipping provider: no credential");
                    self.limiter.refund(provider_slot);
                    self.breaker.release_trial(name, admission);
                    skipped.push(unavailable(name, reason));
                }
            }
        }

        Err(ExhaustedError { skipped })
    }

    /// Hands back a selection that will not be used for a call.
    ///
    /// Refunds its rate window entries and frees the half-open trial it
    /// holds, if any. The credential's LRU position is kept.
    pub fn release(&self, selection: Selection) {
        let name = selection.provider.name.as_str();
        debug!(provider = %name, credential = %selection.credential.id, "Releasing unused selection");
        for slot in selection.slots {
            self.limiter.refund(slot);
        }
        self.breaker.release_trial(name, selection.admission);
    }

    /// Returns whether any candidate still has a credential that is not
    /// disabled, so waiting or retrying could succeed.
    pub fn has_enabled_candidate(&self, candidates: &[Arc<Provider>]) -> bool {
        candidates.iter().any(|p| self.pool.enabled(&p.name) > 0)
    }

    /// Candidate visiting order for one selection.
    fn order(&self, candidates: &[Arc<Provider>]) -> Vec<Arc<Provider>> {
        let mut groups: BTreeMap<u32, Vec<Arc<Provider>>> = BTreeMap::new();
        for provider in candidates {
            groups
                .entry(provider.priority)
                .or_default()
                .push(Arc::clone(provider));
        }

        let tick = match self.strategy {
            RoutingStrategy::RoundRobin => self.round_robin_counter.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };

        let mut ordered = Vec::with_capacity(candidates.len());
        for (_, mut group) in groups {
            match self.strategy {
                RoutingStrategy::Priority => {}
                RoutingStrategy::RoundRobin => {
                    let len = group.len();
                    group.rotate_left(tick % len);
                }
                RoutingStrategy::WeightedRandom { .. } => {
                    group = self.weighted_shuffle(group);
                }
            }
            ordered.extend(group);
        }
        ordered
    }

    /// Weighted sampling without replacement.
    fn weighted_shuffle(&self, mut group: Vec<Arc<Provider>>) -> Vec<Arc<Provider>> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let mut shuffled = Vec::with_capacity(group.len());

        while !group.is_empty() {
            let total: u64 = group.iter().map(|p| u64::from(p.weight.max(1))).sum();
            let mut pick = rng.random_range(0..total);
            let mut index = 0;
            for (i, provider) in group.iter().enumerate() {
                let weight = u64::from(provider.weight.max(1));
                if pick < weight {
                    index = i;
                    break;
                }
                pick -= weight;
            }
            shuffled.push(group.remove(index));
        }
        shuffled
    }
}

fn unavailable(provider: &str, reason: UnavailableReason) -> DispatchError {
    DispatchError::ProviderUnavailable {
        provider: provider.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::dispatch::circuit_breaker::BreakerConfig;
    use crate::dispatch::credentials::CredentialPolicy;
    use crate::dispatch::outcome::Outcome;
    use crate::dispatch::provider::CredentialId;
    use crate::dispatch::rate_limiter::{RateLimitScope, RateWindowConfig};

    struct Fixture {
        router: ProviderRouter,
        providers: Vec<Arc<Provider>>,
        clock: Arc<ManualClock>,
    }

    fn fixture(
        specs: &[(&str, u32, usize)],
        limits: HashMap<String, Vec<RateWindowConfig>>,
        strategy: RoutingStrategy,
    ) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let shared: SharedClock = clock.clone();
        let providers: Vec<Arc<Provider>> = specs
            .iter()
            .map(|(name, priority, _)| {
                Arc::new(Provider::new(*name, "http://localhost", "model").with_priority(*priority))
            })
            .collect();
        let credentials = specs
            .iter()
            .flat_map(|(name, _, keys)| (0..*keys).map(move |i| Credential::new(*name, i, format!("{}-{}", name, i))))
            .collect();

        let router = ProviderRouter::new(
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), shared.clone())),
            Arc::new(RateLimiter::new(RateLimitScope::Provider, limits, shared.clone())),
            Arc::new(CredentialPool::new(CredentialPolicy::default(), credentials, shared)),
            strategy,
        );
        Fixture {
            router,
            providers,
            clock,
        }
    }

    #[test]
    fn test_select_prefers_priority() {
        let f = fixture(&[("b", 1, 1), ("a", 0, 1)], HashMap::new(), RoutingStrategy::Priority);

        for _ in 0..3 {
            let selection = f.router.select(&f.providers).expect("selection");
            assert_eq!(selection.provider.name, "a");
            assert_eq!(selection.admission, Admission::Normal);
        }
    }

    #[test]
    fn test_select_skips_open_circuit() {
        let f = fixture(&[("a", 0, 1), ("b", 1, 2)], HashMap::new(), RoutingStrategy::Priority);
        for _ in 0..5 {
            f.router.breaker().report("a", Outcome::TransientError);
        }

        let selection = f.router.select(&f.providers).expect("selection");
        assert_eq!(selection.provider.name, "b");
    }

    #[test]
    fn test_select_skips_rate_limited_provider() {
        let limits = HashMap::from([("a".to_string(), vec![RateWindowConfig::new(1, 60)])]);
        let f = fixture(&[("a", 0, 1), ("b", 1, 1)], limits, RoutingStrategy::Priority);

        assert_eq!(f.router.select(&f.providers).expect("first").provider.name, "a");
        assert_eq!(f.router.select(&f.providers).expect("second").provider.name, "b");

        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.router.select(&f.providers).expect("third").provider.name, "a");
    }

    #[test]
    fn test_exhausted_when_everything_cools_down() {
        let f = fixture(&[("a", 0, 1), ("b", 0, 1)], HashMap::new(), RoutingStrategy::Priority);
        for provider in ["a", "b"] {
            for _ in 0..3 {
                f.router
                    .pool()
                    .report(&CredentialId::new(provider, 0), Outcome::TransientError);
            }
        }

        let err = f.router.select(&f.providers).expect_err("should be exhausted");
        assert_eq!(err.skipped.len(), 2);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_exhausted_unrecoverable_when_all_disabled() {
        let f = fixture(&[("a", 0, 1)], HashMap::new(), RoutingStrategy::Priority);
        f.router
            .pool()
            .report(&CredentialId::new("a", 0), Outcome::PermanentError);

        let err = f.router.select(&f.providers).expect_err("should be exhausted");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_no_credential_refunds_rate_slot() {
        let limits = HashMap::from([("a".to_string(), vec![RateWindowConfig::new(1, 60)])]);
        let f = fixture(&[("a", 0, 1)], limits, RoutingStrategy::Priority);
        for _ in 0..3 {
            f.router
                .pool()
                .report(&CredentialId::new("a", 0), Outcome::TransientError);
        }

        assert!(f.router.select(&f.providers).is_err());
        assert_eq!(f.router.limiter().usage("a")[0].used, 0);
    }

    #[test]
    fn test_unused_trial_is_released() {
        let f = fixture(&[("a", 0, 1)], HashMap::new(), RoutingStrategy::Priority);
        for _ in 0..5 {
            f.router.breaker().report("a", Outcome::TransientError);
        }
        f.clock.advance(Duration::from_secs(45));
        for _ in 0..3 {
            f.router
                .pool()
                .report(&CredentialId::new("a", 0), Outcome::TransientError);
        }
        f.clock.advance(Duration::from_secs(15));

        // Circuit would admit a trial but the credential is still cooling down.
        assert!(f.router.select(&f.providers).is_err());
        assert!(!f.router.breaker().snapshot("a").trial_in_flight);

        f.clock.advance(Duration::from_secs(15));
        let selection = f.router.select(&f.providers).expect("trial selection");
        assert!(selection.admission.is_trial());
    }

    #[test]
    fn test_release_returns_slot_and_trial() {
        let limits = HashMap::from([("a".to_string(), vec![RateWindowConfig::new(1, 60)])]);
        let f = fixture(&[("a", 0, 1), ("b", 1, 1)], limits, RoutingStrategy::Priority);
        for _ in 0..5 {
            f.router.breaker().report("a", Outcome::TransientError);
        }
        f.clock.advance(Duration::from_secs(60));

        let selection = f.router.select(&f.providers).expect("trial selection");
        assert_eq!(selection.provider.name, "a");
        assert!(selection.admission.is_trial());
        assert_eq!(f.router.limiter().usage("a")[0].used, 1);

        f.router.release(selection);
        assert_eq!(f.router.limiter().usage("a")[0].used, 0);
        assert!(!f.router.breaker().snapshot("a").trial_in_flight);

        let again = f.router.select(&f.providers).expect("trial selection");
        assert_eq!(again.provider.name, "a");
        assert!(again.admission.is_trial());
    }

    #[test]
    fn test_credential_scope_release_refunds_credential_window() {
        let clock = Arc::new(ManualClock::starting_now());
        let shared: SharedClock = clock.clone();
        let limits = HashMap::from([("a".to_string(), vec![RateWindowConfig::new(1, 60)])]);
        let router = ProviderRouter::new(
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), shared.clone())),
            Arc::new(RateLimiter::new(RateLimitScope::Credential, limits, shared.clone())),
            Arc::new(CredentialPool::new(
                CredentialPolicy::default(),
                vec![Credential::new("a", 0, "a-0")],
                shared,
            )),
            RoutingStrategy::Priority,
        );
        let providers = vec![Arc::new(Provider::new("a", "http://localhost", "model"))];

        let selection = router.select(&providers).expect("selection");
        assert!(router.select(&providers).is_err());

        router.release(selection);
        assert!(router.select(&providers).is_ok());
    }

    #[test]
    fn test_has_enabled_candidate_ignores_cooldowns() {
        let f = fixture(&[("a", 0, 1), ("b", 1, 1)], HashMap::new(), RoutingStrategy::Priority);
        f.router
            .pool()
            .report(&CredentialId::new("a", 0), Outcome::PermanentError);
        for _ in 0..3 {
            f.router
                .pool()
                .report(&CredentialId::new("b", 0), Outcome::TransientError);
        }
        assert!(f.router.has_enabled_candidate(&f.providers));

        f.router
            .pool()
            .report(&CredentialId::new("b", 0), Outcome::PermanentError);
        assert!(!f.router.has_enabled_candidate(&f.providers));
    }

    #[test]
    fn test_round_robin_rotates_equal_priority() {
        let f = fixture(
            &[("a", 0, 1), ("b", 0, 1), ("c", 1, 1)],
            HashMap::new(),
            RoutingStrategy::RoundRobin,
        );

        let picks: Vec<String> = (0..4)
            .map(|_| f.router.select(&f.providers).expect("selection").provider.name.clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_weighted_random_is_reproducible() {
        let specs = [("a", 0, 1), ("b", 0, 1), ("c", 0, 1)];
        let run = || {
            let f = fixture(&specs, HashMap::new(), RoutingStrategy::WeightedRandom { seed: 42 });
            (0..20)
                .map(|_| f.router.select(&f.providers).expect("selection").provider.name.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }
}
