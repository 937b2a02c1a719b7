//! Credential pool with per-credential cooldown.
//!
//! The pool owns every API key and its health state. `acquire` hands out the
//! least-recently-used credential that is neither cooling down nor disabled;
//! `report` feeds call outcomes back:
//!
//! - success clears the cooldown and the consecutive-failure counter
//! - a retryable failure bumps the counter; from `failure_threshold` on, the
//!   credential cools down for `base * 2^(failures - threshold)`, capped
//! - a permanent failure disables the credential for the process lifetime
//!
//! State is kept per provider behind its own mutex so that selection and
//! outcome recording for one provider are serialized without contending
//! with other providers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{to_chrono, SharedClock};
use crate::error::UnavailableReason;

use super::outcome::Outcome;
use super::provider::{Credential, CredentialId};

/// Cooldown policy for credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialPolicy {
    /// Consecutive failures before a credential starts cooling down.
    pub failure_threshold: u32,
    /// Cooldown applied when the threshold is first reached.
    pub base_cooldown_secs: u64,
    /// Upper bound on a single cooldown.
    pub max_cooldown_secs: u64,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_secs: 30,
            max_cooldown_secs: 900,
        }
    }
}

impl CredentialPolicy {
    /// Cooldown after `failures` consecutive failures, or `None` below the
    /// threshold.
    pub fn cooldown(&self, failures: u32) -> Option<Duration> {
        if failures < self.failure_threshold {
            return None;
        }
        let exponent = (failures - self.failure_threshold).min(32);
        let secs = self
            .base_cooldown_secs
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_cooldown_secs);
        Some(Duration::from_secs(secs))
    }
}

/// Point-in-time view of one credential, for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub id: CredentialId,
    pub fingerprint: String,
    pub available: bool,
    pub disabled: bool,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub uses: u64,
}

#[derive(Debug, Default)]
struct CredentialState {
    cooldown_until: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    disabled: bool,
    /// Monotonic selection stamp; `None` means never used.
    last_used: Option<u64>,
    uses: u64,
}

impl CredentialState {
    fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.disabled && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug)]
struct Slot {
    credential: Credential,
    state: CredentialState,
}

#[derive(Debug, Default)]
struct ProviderSlots {
    slots: Vec<Slot>,
    sequence: u64,
}

/// Pool of credentials for all providers.
pub struct CredentialPool {
    policy: CredentialPolicy,
    providers: HashMap<String, Mutex<ProviderSlots>>,
    clock: SharedClock,
}

impl CredentialPool {
    /// Creates a pool from a flat list of credentials.
    pub fn new(policy: CredentialPolicy, credentials: Vec<Credential>, clock: SharedClock) -> Self {
        let mut grouped: HashMap<String, ProviderSlots> = HashMap::new();
        for credential in credentials {
            grouped
                .entry(credential.provider().to_string())
                .or_default()
                .slots
                .push(Slot {
                    credential,
                    state: CredentialState::default(),
                });
        }

        let providers = grouped
            .into_iter()
            .map(|(name, slots)| (name, Mutex::new(slots)))
            .collect();

        Self {
            policy,
            providers,
            clock,
        }
    }

    /// Returns the least-recently-used available credential for `provider`.
    pub fn acquire(&self, provider: &str) -> Option<Credential> {
        self.acquire_where(provider, |_| true).ok()
    }

    /// Like [`acquire`](Self::acquire), additionally requiring `admit` to
    /// accept the credential. `admit` is called in LRU order under the
    /// provider lock, so it may claim per-credential resources.
    pub fn acquire_where<F>(&self, provider: &str, mut admit: F) -> Result<Credential, UnavailableReason>
    where
        F: FnMut(&Credential) -> bool,
    {
        let Some(entry) = self.providers.get(provider) else {
            return Err(UnavailableReason::CredentialsDisabled);
        };
        let now = self.clock.now();
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        let slots = &mut *guard;

        let mut candidates: Vec<usize> = slots
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_available(now))
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            let all_disabled = slots.slots.iter().all(|slot| slot.state.disabled);
            return Err(if all_disabled {
                UnavailableReason::CredentialsDisabled
            } else {
                UnavailableReason::CredentialsCoolingDown
            });
        }

        // Never-used first, then oldest use; index breaks ties.
        candidates.sort_by_key(|&i| (slots.slots[i].state.last_used, i));

        for i in candidates {
            if !admit(&slots.slots[i].credential) {
                continue;
            }
            slots.sequence += 1;
            let slot = &mut slots.slots[i];
            slot.state.last_used = Some(slots.sequence);
            slot.state.uses += 1;
            // An expired cooldown is cleared lazily on reuse.
            if slot.state.cooldown_until.is_some_and(|until| until <= now) {
                slot.state.cooldown_until = None;
            }
            return Ok(slot.credential.clone());
        }

        Err(UnavailableReason::RateLimited)
    }

    /// Records the outcome of a call made with `credential`.
    pub fn report(&self, credential: &CredentialId, outcome: Outcome) {
        let Some(entry) = self.providers.get(&credential.provider) else {
            return;
        };
        let now = self.clock.now();
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = guard.slots.iter_mut().find(|s| &s.credential.id == credential) else {
            return;
        };
        let state = &mut slot.state;

        match outcome {
            Outcome::Success => {
                if state.consecutive_failures > 0 || state.cooldown_until.is_some() {
                    debug!(credential = %credential, "Credential recovered");
                }
                state.consecutive_failures = 0;
                state.cooldown_until = None;
            }
            Outcome::PermanentError => {
                if !state.disabled {
                    warn!(
                        credential = %credential,
                        fingerprint = %slot.credential.secret.fingerprint(),
                        "Credential disabled after permanent error"
                    );
                }
                state.disabled = true;
                state.cooldown_until = None;
            }
            Outcome::RateLimited | Outcome::TransientError | Outcome::Timeout => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if let Some(cooldown) = self.policy.cooldown(state.consecutive_failures) {
                    let until = now + to_chrono(cooldown);
                    state.cooldown_until = Some(until);
                    info!(
                        credential = %credential,
                        failures = state.consecutive_failures,
                        cooldown_secs = cooldown.as_secs(),
                        outcome = %outcome,
                        "Credential cooling down"
                    );
                }
            }
        }
    }

    /// Number of credentials currently available for `provider`.
    pub fn available(&self, provider: &str) -> usize {
        let now = self.clock.now();
        self.providers
            .get(provider)
            .map(|entry| {
                entry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .slots
                    .iter()
                    .filter(|slot| slot.state.is_available(now))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of credentials of `provider` that are not disabled, cooling
    /// down or not.
    pub fn enabled(&self, provider: &str) -> usize {
        self.providers
            .get(provider)
            .map(|entry| {
                entry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .slots
                    .iter()
                    .filter(|slot| !slot.state.disabled)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of credentials configured for `provider`.
    pub fn total(&self, provider: &str) -> usize {
        self.providers
            .get(provider)
            .map(|entry| entry.lock().unwrap_or_else(|e| e.into_inner()).slots.len())
            .unwrap_or(0)
    }

    /// Status of every credential of `provider`, in slot order.
    pub fn snapshot(&self, provider: &str) -> Vec<CredentialStatus> {
        let now = self.clock.now();
        let Some(entry) = self.providers.get(provider) else {
            return Vec::new();
        };
        let guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .slots
            .iter()
            .map(|slot| CredentialStatus {
                id: slot.credential.id.clone(),
                fingerprint: slot.credential.secret.fingerprint(),
                available: slot.state.is_available(now),
                disabled: slot.state.disabled,
                consecutive_failures: slot.state.consecutive_failures,
                cooldown_until: slot.state.cooldown_until,
                uses: slot.state.uses,
            })
            .collect()
    }

    pub fn policy(&self) -> &CredentialPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn pool_with(keys: &[(&str, usize)]) -> (CredentialPool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let credentials = keys
            .iter()
            .flat_map(|(provider, count)| {
                (0..*count).map(move |i| Credential::new(*provider, i, format!("{}-key-{}", provider, i)))
            })
            .collect();
        let pool = CredentialPool::new(CredentialPolicy::default(), credentials, clock.clone());
        (pool, clock)
    }

    #[test]
    fn test_acquire_round_robin() {
        let (pool, _) = pool_with(&[("groq", 3)]);

        let picks: Vec<usize> = (0..6)
            .map(|_| pool.acquire("groq").expect("credential").id.index)
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_acquire_unknown_provider() {
        let (pool, _) = pool_with(&[("groq", 1)]);
        assert!(pool.acquire("gemini").is_none());
        assert_eq!(
            pool.acquire_where("gemini", |_| true).unwrap_err(),
            UnavailableReason::CredentialsDisabled
        );
    }

    #[test]
    fn test_cooldown_after_threshold() {
        let (pool, clock) = pool_with(&[("groq", 1)]);
        let id = CredentialId::new("groq", 0);

        pool.report(&id, Outcome::TransientError);
        pool.report(&id, Outcome::Timeout);
        assert!(pool.acquire("groq").is_some());

        let start = clock.now();
        pool.report(&id, Outcome::RateLimited);
        let status = &pool.snapshot("groq")[0];
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(
            status.cooldown_until,
            Some(start + chrono::Duration::seconds(30))
        );
        assert!(pool.acquire("groq").is_none());
        assert_eq!(
            pool.acquire_where("groq", |_| true).unwrap_err(),
            UnavailableReason::CredentialsCoolingDown
        );

        clock.advance(Duration::from_secs(30));
        assert!(pool.acquire("groq").is_some());

        let after = clock.now();
        pool.report(&id, Outcome::TransientError);
        let status = &pool.snapshot("groq")[0];
        assert_eq!(
            status.cooldown_until,
            Some(after + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn test_success_resets_failures() {
        let (pool, _) = pool_with(&[("groq", 1)]);
        let id = CredentialId::new("groq", 0);

        for _ in 0..3 {
            pool.report(&id, Outcome::TransientError);
        }
        assert_eq!(pool.available("groq"), 0);

        pool.report(&id, Outcome::Success);
        let status = &pool.snapshot("groq")[0];
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.cooldown_until.is_none());
        assert_eq!(pool.available("groq"), 1);
    }

    #[test]
    fn test_permanent_error_disables_credential() {
        let (pool, clock) = pool_with(&[("groq", 2)]);
        let bad = CredentialId::new("groq", 0);

        pool.report(&bad, Outcome::PermanentError);
        pool.report(&CredentialId::new("groq", 1), Outcome::Success);
        clock.advance(Duration::from_secs(86_400));

        for _ in 0..10 {
            let credential = pool.acquire("groq").expect("second credential");
            assert_ne!(credential.id, bad);
        }
        assert!(pool.snapshot("groq")[0].disabled);
    }

    #[test]
    fn test_all_disabled_reason() {
        let (pool, _) = pool_with(&[("cohere", 2)]);
        pool.report(&CredentialId::new("cohere", 0), Outcome::PermanentError);
        pool.report(&CredentialId::new("cohere", 1), Outcome::PermanentError);

        assert_eq!(
            pool.acquire_where("cohere", |_| true).unwrap_err(),
            UnavailableReason::CredentialsDisabled
        );
        assert_eq!(pool.enabled("cohere"), 0);
    }

    #[test]
    fn test_enabled_counts_cooling_credentials() {
        let (pool, _) = pool_with(&[("groq", 2)]);
        pool.report(&CredentialId::new("groq", 0), Outcome::PermanentError);
        for _ in 0..3 {
            pool.report(&CredentialId::new("groq", 1), Outcome::TransientError);
        }

        assert_eq!(pool.available("groq"), 0);
        assert_eq!(pool.enabled("groq"), 1);
        assert_eq!(pool.enabled("gemini"), 0);
    }

    #[test]
    fn test_admit_filter_skips_to_next_lru() {
        let (pool, _) = pool_with(&[("groq", 2)]);

        let credential = pool
            .acquire_where("groq", |c| c.id.index != 0)
            .expect("second credential admitted");
        assert_eq!(credential.id.index, 1);

        assert_eq!(
            pool.acquire_where("groq", |_| false).unwrap_err(),
            UnavailableReason::RateLimited
        );
    }

    #[test]
    fn test_cooldown_is_capped() {
        let policy = CredentialPolicy {
            failure_threshold: 3,
            base_cooldown_secs: 30,
            max_cooldown_secs: 900,
        };
        assert_eq!(policy.cooldown(2), None);
        assert_eq!(policy.cooldown(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.cooldown(4), Some(Duration::from_secs(60)));
        assert_eq!(policy.cooldown(8), Some(Duration::from_secs(900)));
        assert_eq!(policy.cooldown(500), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_concurrent_acquire_distributes_uses() {
        let (pool, _) = pool_with(&[("groq", 4)]);
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        pool.acquire("groq").expect("credential");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread should not panic");
        }

        let uses: Vec<u64> = pool.snapshot("groq").iter().map(|s| s.uses).collect();
        assert_eq!(uses.iter().sum::<u64>(), 800);
        assert!(uses.iter().all(|&u| u == 200));
    }
}
