//! Non-blocking sliding-window rate limiter.
//!
//! Each limited key (a provider, or a single credential when the scope is
//! per-credential) keeps one timestamp log per configured window. A call is
//! admitted only if every window has room; admission records the call in
//! every window under the same lock, so two concurrent callers can never
//! both take the last slot.
//!
//! `try_acquire` never waits. A full window means "try another candidate".
//! An admission returns a [`RateSlot`] naming the exact entry it recorded,
//! so a caller that ends up not calling can hand that entry back.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{to_chrono, SharedClock};

use super::provider::CredentialId;

/// One capacity/window pair, e.g. 30 calls per 60 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindowConfig {
    pub capacity: u32,
    pub window_secs: u64,
}

impl RateWindowConfig {
    pub fn new(capacity: u32, window_secs: u64) -> Self {
        Self {
            capacity,
            window_secs,
        }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, 60)
    }

    pub fn per_hour(capacity: u32) -> Self {
        Self::new(capacity, 3600)
    }

    pub fn per_day(capacity: u32) -> Self {
        Self::new(capacity, 86_400)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// What a rate window is counted against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// All credentials of a provider share its windows.
    #[default]
    Provider,
    /// Every credential has its own windows.
    Credential,
}

/// Current usage of one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowUsage {
    pub capacity: u32,
    pub window_secs: u64,
    pub used: u32,
}

impl WindowUsage {
    /// Used fraction of the window, in percent.
    pub fn percent(&self) -> f64 {
        if self.capacity == 0 {
            return 100.0;
        }
        self.used as f64 / self.capacity as f64 * 100.0
    }
}

/// One admitted call, as recorded by the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct RateSlot {
    /// Limited key the call was recorded under; `None` when nothing was recorded.
    key: Option<String>,
    admitted_at: DateTime<Utc>,
}

impl RateSlot {
    fn unrecorded(now: DateTime<Utc>) -> Self {
        Self {
            key: None,
            admitted_at: now,
        }
    }

    /// Whether the admission took room in any window.
    pub fn is_recorded(&self) -> bool {
        self.key.is_some()
    }
}

#[derive(Debug, Default)]
struct KeyState {
    /// One log per configured window, oldest call first.
    logs: Vec<VecDeque<DateTime<Utc>>>,
    blocked_until: Option<DateTime<Utc>>,
}

impl KeyState {
    fn prune(&mut self, windows: &[RateWindowConfig], now: DateTime<Utc>) {
        if self.logs.len() != windows.len() {
            self.logs.resize_with(windows.len(), VecDeque::new);
        }
        for (log, window) in self.logs.iter_mut().zip(windows) {
            let horizon = now - to_chrono(window.window());
            while log.front().is_some_and(|&t| t <= horizon) {
                log.pop_front();
            }
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }
}

/// Sliding-window limiter over providers or credentials.
pub struct RateLimiter {
    scope: RateLimitScope,
    limits: HashMap<String, Vec<RateWindowConfig>>,
    keys: Mutex<HashMap<String, KeyState>>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Creates a limiter. Providers absent from `limits` are unlimited.
    pub fn new(
        scope: RateLimitScope,
        limits: HashMap<String, Vec<RateWindowConfig>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            scope,
            limits,
            keys: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn scope(&self) -> RateLimitScope {
        self.scope
    }

    /// Admits one call against the provider's own windows.
    ///
    /// Always admits when the scope is per-credential; the credential check
    /// happens in [`try_acquire_credential`](Self::try_acquire_credential).
    pub fn try_acquire(&self, provider: &str) -> Option<RateSlot> {
        match self.scope {
            RateLimitScope::Provider => self.try_acquire_key(provider, provider),
            RateLimitScope::Credential => Some(RateSlot::unrecorded(self.clock.now())),
        }
    }

    /// Admits one call against a credential's windows.
    ///
    /// Always admits when the scope is per-provider.
    pub fn try_acquire_credential(&self, credential: &CredentialId) -> Option<RateSlot> {
        match self.scope {
            RateLimitScope::Provider => Some(RateSlot::unrecorded(self.clock.now())),
            RateLimitScope::Credential => {
                self.try_acquire_key(&credential.provider, &credential.to_string())
            }
        }
    }

    fn try_acquire_key(&self, provider: &str, key: &str) -> Option<RateSlot> {
        // Providers without windows are unlimited but still honor throttling hints.
        let windows = self.limits.get(provider).map(Vec::as_slice).unwrap_or(&[]);
        let now = self.clock.now();
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if windows.is_empty() && !keys.contains_key(key) {
            return Some(RateSlot::unrecorded(now));
        }
        let state = keys.entry(key.to_string()).or_default();
        state.prune(windows, now);

        if state.blocked_until.is_some() {
            debug!(key = %key, "Rate limiter key blocked by provider hint");
            return None;
        }

        let full = state
            .logs
            .iter()
            .zip(windows)
            .any(|(log, window)| log.len() >= window.capacity as usize);
        if full {
            return None;
        }

        for log in &mut state.logs {
            log.push_back(now);
        }
        Some(RateSlot {
            key: (!state.logs.is_empty()).then(|| key.to_string()),
            admitted_at: now,
        })
    }

    /// Hands back an admission that was never used for a call.
    ///
    /// Removes the entry `slot` recorded, leaving every other caller's
    /// admissions in place. Entries already outside their window are gone.
    pub fn refund(&self, slot: RateSlot) {
        let Some(key) = slot.key else {
            return;
        };
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = keys.get_mut(&key) {
            for log in &mut state.logs {
                if let Some(index) = log.iter().rposition(|&t| t == slot.admitted_at) {
                    log.remove(index);
                }
            }
        }
    }

    /// Blocks the key that `credential` maps to until `until`.
    ///
    /// Applied when a provider answers with a throttling hint.
    pub fn block_until(&self, credential: &CredentialId, until: DateTime<Utc>) {
        let key = self.key_for(credential);
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let state = keys.entry(key).or_default();
        if state.blocked_until.is_none_or(|current| current < until) {
            state.blocked_until = Some(until);
        }
    }

    /// Current window usage for a provider (provider scope) or summed over
    /// its credentials (credential scope).
    pub fn usage(&self, provider: &str) -> Vec<WindowUsage> {
        let Some(windows) = self.limits.get(provider) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());

        let mut used = vec![0u32; windows.len()];
        let mut instances = 0u32;
        for (key, state) in keys.iter_mut() {
            let matches = match self.scope {
                RateLimitScope::Provider => key == provider,
                RateLimitScope::Credential => key
                    .rsplit_once('#')
                    .is_some_and(|(name, _)| name == provider),
            };
            if !matches {
                continue;
            }
            instances += 1;
            state.prune(windows, now);
            for (total, log) in used.iter_mut().zip(&state.logs) {
                *total += log.len() as u32;
            }
        }

        let multiplier = match self.scope {
            RateLimitScope::Provider => 1,
            RateLimitScope::Credential => instances.max(1),
        };
        windows
            .iter()
            .zip(used)
            .map(|(window, used)| WindowUsage {
                capacity: window.capacity * multiplier,
                window_secs: window.window_secs,
                used,
            })
            .collect()
    }

    fn key_for(&self, credential: &CredentialId) -> String {
        match self.scope {
            RateLimitScope::Provider => credential.provider.clone(),
            RateLimitScope::Credential => credential.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn limiter(scope: RateLimitScope, windows: Vec<RateWindowConfig>) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let limits = HashMap::from([("groq".to_string(), windows)]);
        (RateLimiter::new(scope, limits, clock.clone()), clock)
    }

    #[test]
    fn test_capacity_then_window_reset() {
        for capacity in [1u32, 3, 10] {
            let (limiter, clock) =
                limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(capacity, 60)]);

            for _ in 0..capacity {
                assert!(limiter.try_acquire("groq").is_some());
            }
            assert!(limiter.try_acquire("groq").is_none());

            clock.advance(Duration::from_secs(59));
            assert!(limiter.try_acquire("groq").is_none());

            clock.advance(Duration::from_secs(1));
            assert!(limiter.try_acquire("groq").is_some());
        }
    }

    #[test]
    fn test_sliding_window_counts_recent_calls_only() {
        let (limiter, clock) = limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(2, 10)]);

        assert!(limiter.try_acquire("groq").is_some());
        clock.advance(Duration::from_secs(6));
        assert!(limiter.try_acquire("groq").is_some());
        assert!(limiter.try_acquire("groq").is_none());

        // The first call leaves the window; the second is still inside.
        clock.advance(Duration::from_secs(4));
        assert!(limiter.try_acquire("groq").is_some());
        assert!(limiter.try_acquire("groq").is_none());
    }

    #[test]
    fn test_unlimited_provider() {
        let (limiter, _) = limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(1, 60)]);
        for _ in 0..100 {
            assert!(limiter.try_acquire("cohere").is_some());
        }
    }

    #[test]
    fn test_multiple_windows_all_must_have_room() {
        let (limiter, clock) = limiter(
            RateLimitScope::Provider,
            vec![RateWindowConfig::per_minute(2), RateWindowConfig::per_hour(3)],
        );

        assert!(limiter.try_acquire("groq").is_some());
        assert!(limiter.try_acquire("groq").is_some());
        assert!(limiter.try_acquire("groq").is_none());

        clock.advance(Duration::from_secs(60));
        assert!(limiter.try_acquire("groq").is_some());
        assert!(limiter.try_acquire("groq").is_none());

        let usage = limiter.usage("groq");
        assert_eq!(usage[0].used, 1);
        assert_eq!(usage[1].used, 3);
        assert!((usage[1].percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_refund_releases_slot() {
        let (limiter, _) = limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(1, 60)]);

        let slot = limiter.try_acquire("groq").expect("room in window");
        assert!(slot.is_recorded());
        limiter.refund(slot);
        assert!(limiter.try_acquire("groq").is_some());
    }

    #[test]
    fn test_refund_removes_only_its_own_entry() {
        let (limiter, clock) = limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(2, 60)]);

        let earlier = limiter.try_acquire("groq").expect("first slot");
        clock.advance(Duration::from_secs(40));
        let _later = limiter.try_acquire("groq").expect("second slot");
        assert!(limiter.try_acquire("groq").is_none());

        limiter.refund(earlier);
        assert_eq!(limiter.usage("groq")[0].used, 1);

        // The later call is still counted until its own window passes.
        clock.advance(Duration::from_secs(30));
        assert!(limiter.try_acquire("groq").is_some());
        assert!(limiter.try_acquire("groq").is_none());
        clock.advance(Duration::from_secs(30));
        assert!(limiter.try_acquire("groq").is_some());
    }

    #[test]
    fn test_unlimited_admission_is_not_recorded() {
        let (limiter, _) = limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(1, 60)]);
        let slot = limiter.try_acquire("cohere").expect("unlimited");
        assert!(!slot.is_recorded());
        limiter.refund(slot);
    }

    #[test]
    fn test_credential_scope() {
        let (limiter, _) = limiter(RateLimitScope::Credential, vec![RateWindowConfig::new(1, 60)]);
        let first = CredentialId::new("groq", 0);
        let second = CredentialId::new("groq", 1);

        assert!(limiter.try_acquire("groq").is_some());
        assert!(limiter.try_acquire_credential(&first).is_some());
        assert!(limiter.try_acquire_credential(&first).is_none());
        assert!(limiter.try_acquire_credential(&second).is_some());

        let usage = limiter.usage("groq");
        assert_eq!(usage[0].used, 2);
        assert_eq!(usage[0].capacity, 2);
    }

    #[test]
    fn test_block_until_hint() {
        let (limiter, clock) = limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(100, 60)]);
        let credential = CredentialId::new("groq", 0);

        limiter.block_until(&credential, clock.now() + chrono::Duration::seconds(20));
        assert!(limiter.try_acquire("groq").is_none());

        clock.advance(Duration::from_secs(20));
        assert!(limiter.try_acquire("groq").is_some());
    }

    #[test]
    fn test_block_until_applies_to_unlimited_provider() {
        let (limiter, clock) = limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(1, 60)]);
        let credential = CredentialId::new("cohere", 0);

        limiter.block_until(&credential, clock.now() + chrono::Duration::seconds(5));
        assert!(limiter.try_acquire("cohere").is_none());

        clock.advance(Duration::from_secs(5));
        assert!(limiter.try_acquire("cohere").is_some());
        assert!(limiter.try_acquire("cohere").is_some());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_capacity() {
        let (limiter, _) = limiter(RateLimitScope::Provider, vec![RateWindowConfig::new(50, 60)]);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter_map(|_| limiter.try_acquire("groq")).count())
            })
            .collect();
        let admitted: usize = handles
            .into_iter()
            .map(|h| h.join().expect("thread should not panic"))
            .sum();

        assert_eq!(admitted, 50);
    }
}
