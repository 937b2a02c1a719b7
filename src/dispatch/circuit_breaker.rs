//! Per-provider circuit breaker.
//!
//! ```text
//!            threshold failures in window
//!   closed ───────────────────────────────▶ open
//!     ▲                                      │ cooldown elapsed,
//!     │ trial succeeds                       │ first caller admitted
//!     │                                      ▼
//!     └────────────────────────────────── half_open
//!                 trial fails: back to open, cooldown doubled
//! ```
//!
//! Only one trial call is admitted while half-open. The breaker cooldown
//! grows as `base * 2^trips` up to a cap and resets once a trial succeeds.
//!
//! [`admit`](CircuitBreaker::admit) hands out an [`Admission`] that the caller
//! passes back when reporting. Only the outcome of the current trial can
//! close or re-open a half-open circuit; late reports from calls admitted
//! while the circuit was closed are ignored there.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{to_chrono, SharedClock};

use super::outcome::Outcome;

/// Breaker thresholds and cooldowns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// When false, `admit` always admits and reports are ignored.
    pub enabled: bool,
    /// Failures within `window_secs` that trip the circuit.
    pub failure_threshold: u32,
    /// Length of the failure evaluation window.
    pub window_secs: u64,
    /// Open duration after the first trip.
    pub base_cooldown_secs: u64,
    /// Upper bound on the open duration.
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            window_secs: 60,
            base_cooldown_secs: 60,
            max_cooldown_secs: 900,
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_window_secs(mut self, secs: u64) -> Self {
        self.window_secs = secs;
        self
    }

    pub fn with_cooldown_secs(mut self, base: u64, max: u64) -> Self {
        self.base_cooldown_secs = base;
        self.max_cooldown_secs = max;
        self
    }

    /// Open duration for the trip following `previous_trips` consecutive trips.
    pub fn cooldown(&self, previous_trips: u32) -> Duration {
        let secs = self
            .base_cooldown_secs
            .saturating_mul(2u64.saturating_pow(previous_trips.min(32)))
            .min(self.max_cooldown_secs);
        Duration::from_secs(secs)
    }
}

/// Circuit state of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the breaker-state gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// How a call was let through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted while the circuit was closed, or with the breaker disabled.
    Normal,
    /// The single half-open trial. `epoch` identifies which trial.
    Trial { epoch: u64 },
}

impl Admission {
    pub fn is_trial(&self) -> bool {
        matches!(self, Admission::Trial { .. })
    }
}

/// Point-in-time view of a provider's circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub failures_in_window: u32,
    pub consecutive_trips: u32,
    pub last_transition: DateTime<Utc>,
    /// Earliest time a trial call will be admitted, when open.
    pub next_probe_at: Option<DateTime<Utc>>,
    pub trial_in_flight: bool,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    open_until: Option<DateTime<Utc>>,
    trips: u32,
    trial_in_flight: bool,
    /// Bumped on every trial admission; never reset.
    trial_epoch: u64,
    last_transition: DateTime<Utc>,
}

impl Circuit {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            open_until: None,
            trips: 0,
            trial_in_flight: false,
            trial_epoch: 0,
            last_transition: now,
        }
    }

    fn start_trial(&mut self) -> Admission {
        self.trial_in_flight = true;
        self.trial_epoch += 1;
        Admission::Trial {
            epoch: self.trial_epoch,
        }
    }

    /// Whether `admission` is the trial currently in flight.
    fn holds_trial(&self, admission: Admission) -> bool {
        self.state == CircuitState::HalfOpen
            && self.trial_in_flight
            && admission
                == Admission::Trial {
                    epoch: self.trial_epoch,
                }
    }

    fn prune(&mut self, window: Duration, now: DateTime<Utc>) {
        let horizon = now - to_chrono(window);
        while self.failures.front().is_some_and(|&t| t <= horizon) {
            self.failures.pop_front();
        }
    }
}

/// Circuit breaker tracking every provider independently.
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Admits a call to `provider`, or returns `None` while the circuit is open.
    ///
    /// When the cooldown of an open circuit has elapsed, the first caller is
    /// admitted as the half-open trial and every other caller is rejected
    /// until that trial reports or is released.
    pub fn admit(&self, provider: &str) -> Option<Admission> {
        if !self.config.enabled {
            return Some(Admission::Normal);
        }
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let circuit = circuits
            .entry(provider.to_string())
            .or_insert_with(|| Circuit::new(now));

        match circuit.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                if circuit.open_until.is_some_and(|until| now >= until) {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.last_transition = now;
                    info!(provider = %provider, "Circuit half-open, admitting trial call");
                    Some(circuit.start_trial())
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    None
                } else {
                    Some(circuit.start_trial())
                }
            }
        }
    }

    /// Records the outcome of a call admitted as [`Admission::Normal`].
    pub fn report(&self, provider: &str, outcome: Outcome) {
        self.report_admitted(provider, Admission::Normal, outcome);
    }

    /// Records the outcome of a call admitted by [`admit`](Self::admit).
    pub fn report_admitted(&self, provider: &str, admission: Admission, outcome: Outcome) {
        if !self.config.enabled {
            return;
        }
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.window_secs);
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let circuit = circuits
            .entry(provider.to_string())
            .or_insert_with(|| Circuit::new(now));

        match circuit.state {
            CircuitState::Closed => match outcome {
                Outcome::Success => circuit.failures.clear(),
                o if o.counts_against_provider() => {
                    circuit.failures.push_back(now);
                    circuit.prune(window, now);
                    if circuit.failures.len() as u32 >= self.config.failure_threshold {
                        self.trip(provider, circuit, now);
                    }
                }
                _ => {}
            },
            CircuitState::HalfOpen if circuit.holds_trial(admission) => match outcome {
                Outcome::Success => {
                    circuit.state = CircuitState::Closed;
                    circuit.trial_in_flight = false;
                    circuit.trips = 0;
                    circuit.failures.clear();
                    circuit.open_until = None;
                    circuit.last_transition = now;
                    info!(provider = %provider, "Circuit closed after successful trial");
                }
                o if o.counts_against_provider() => self.trip(provider, circuit, now),
                // Says nothing about provider health; let another caller take the trial.
                _ => circuit.trial_in_flight = false,
            },
            _ => {
                debug!(
                    provider = %provider,
                    state = %circuit.state,
                    outcome = %outcome,
                    "Ignoring outcome of a call not holding the trial"
                );
            }
        }
    }

    /// Gives up a half-open trial slot that was admitted but never used.
    ///
    /// No-op unless `admission` is the trial currently in flight.
    pub fn release_trial(&self, provider: &str, admission: Admission) {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(circuit) = circuits.get_mut(provider) {
            if circuit.holds_trial(admission) {
                circuit.trial_in_flight = false;
            }
        }
    }

    /// Forces a provider's circuit closed.
    pub fn reset(&self, provider: &str) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let epoch = circuits.get(provider).map_or(0, |c| c.trial_epoch);
        let mut circuit = Circuit::new(now);
        // Keeps any trial admitted before the reset from matching a later one.
        circuit.trial_epoch = epoch;
        circuits.insert(provider.to_string(), circuit);
        info!(provider = %provider, "Circuit manually reset");
    }

    /// Current state of `provider`'s circuit.
    pub fn state(&self, provider: &str) -> CircuitState {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .get(provider)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of `provider`'s circuit.
    pub fn snapshot(&self, provider: &str) -> BreakerSnapshot {
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.window_secs);
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let circuit = circuits
            .entry(provider.to_string())
            .or_insert_with(|| Circuit::new(now));
        circuit.prune(window, now);

        BreakerSnapshot {
            provider: provider.to_string(),
            state: circuit.state,
            failures_in_window: circuit.failures.len() as u32,
            consecutive_trips: circuit.trips,
            last_transition: circuit.last_transition,
            next_probe_at: match circuit.state {
                CircuitState::Open => circuit.open_until,
                _ => None,
            },
            trial_in_flight: circuit.trial_in_flight,
        }
    }

    fn trip(&self, provider: &str, circuit: &mut Circuit, now: DateTime<Utc>) {
        let cooldown = self.config.cooldown(circuit.trips);
        circuit.state = CircuitState::Open;
        circuit.open_until = Some(now + to_chrono(cooldown));
        circuit.trips = circuit.trips.saturating_add(1);
        circuit.trial_in_flight = false;
        circuit.failures.clear();
        circuit.last_transition = now;
        warn!(
            provider = %provider,
            cooldown_secs = cooldown.as_secs(),
            trips = circuit.trips,
            "Circuit opened"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn breaker(config: BreakerConfig) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (CircuitBreaker::new(config, clock.clone()), clock)
    }

    fn fail(breaker: &CircuitBreaker, provider: &str, times: usize) {
        for _ in 0..times {
            breaker.report(provider, Outcome::TransientError);
        }
    }

    #[test]
    fn test_trips_after_threshold_and_stays_open_until_cooldown() {
        for (threshold, cooldown) in [(1u32, 10u64), (5, 60), (8, 120)] {
            let (breaker, clock) = breaker(
                BreakerConfig::default()
                    .with_failure_threshold(threshold)
                    .with_cooldown_secs(cooldown, cooldown * 10),
            );

            fail(&breaker, "groq", threshold as usize - 1);
            assert!(breaker.admit("groq").is_some());

            fail(&breaker, "groq", 1);
            assert_eq!(breaker.state("groq"), CircuitState::Open);

            for _ in 0..3 {
                assert!(breaker.admit("groq").is_none());
                clock.advance(Duration::from_secs(cooldown / 4));
            }
            clock.set(breaker.snapshot("groq").next_probe_at.expect("open circuit"));
            assert!(breaker.admit("groq").is_some());
            assert_eq!(breaker.state("groq"), CircuitState::HalfOpen);
        }
    }

    #[test]
    fn test_failures_outside_window_do_not_trip() {
        let (breaker, clock) = breaker(BreakerConfig::default());

        for _ in 0..10 {
            fail(&breaker, "groq", 1);
            clock.advance(Duration::from_secs(15));
        }
        assert_eq!(breaker.state("groq"), CircuitState::Closed);
        assert!(breaker.snapshot("groq").failures_in_window < 5);
    }

    #[test]
    fn test_permanent_errors_do_not_trip() {
        let (breaker, _) = breaker(BreakerConfig::default());
        for _ in 0..20 {
            breaker.report("groq", Outcome::PermanentError);
        }
        assert!(breaker.admit("groq").is_some());
    }

    #[test]
    fn test_half_open_success_closes() {
        let (breaker, clock) = breaker(BreakerConfig::default());
        fail(&breaker, "groq", 5);

        clock.advance(Duration::from_secs(60));
        let trial = breaker.admit("groq").expect("trial admitted");
        assert!(trial.is_trial());
        assert!(breaker.admit("groq").is_none());

        breaker.report_admitted("groq", trial, Outcome::Success);
        assert_eq!(breaker.state("groq"), CircuitState::Closed);
        assert!(breaker.admit("groq").is_some());
        assert_eq!(breaker.snapshot("groq").consecutive_trips, 0);
    }

    #[test]
    fn test_half_open_failure_doubles_cooldown() {
        let (breaker, clock) = breaker(BreakerConfig::default().with_cooldown_secs(60, 150));
        fail(&breaker, "groq", 5);

        clock.advance(Duration::from_secs(60));
        let trial = breaker.admit("groq").expect("trial admitted");
        let reopened_at = clock.now();
        breaker.report_admitted("groq", trial, Outcome::Timeout);

        let snapshot = breaker.snapshot("groq");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(
            snapshot.next_probe_at,
            Some(reopened_at + chrono::Duration::seconds(120))
        );

        clock.advance(Duration::from_secs(120));
        let trial = breaker.admit("groq").expect("trial admitted");
        let reopened_at = clock.now();
        breaker.report_admitted("groq", trial, Outcome::TransientError);
        assert_eq!(
            breaker.snapshot("groq").next_probe_at,
            Some(reopened_at + chrono::Duration::seconds(150))
        );
    }

    #[test]
    fn test_release_trial_admits_next_caller() {
        let (breaker, clock) = breaker(BreakerConfig::default());
        fail(&breaker, "groq", 5);
        clock.advance(Duration::from_secs(60));

        let trial = breaker.admit("groq").expect("trial admitted");
        breaker.release_trial("groq", trial);
        assert!(breaker.admit("groq").is_some());
        assert!(breaker.admit("groq").is_none());
    }

    #[test]
    fn test_only_the_trial_decides_a_half_open_circuit() {
        let (breaker, clock) = breaker(BreakerConfig::default());
        let early = breaker.admit("groq").expect("closed circuit admits");
        assert_eq!(early, Admission::Normal);

        fail(&breaker, "groq", 5);
        clock.advance(Duration::from_secs(60));
        let trial = breaker.admit("groq").expect("trial admitted");

        // The call admitted before the trip finishes while the trial is out.
        breaker.report_admitted("groq", early, Outcome::Success);
        assert_eq!(breaker.state("groq"), CircuitState::HalfOpen);
        breaker.release_trial("groq", early);
        assert!(breaker.snapshot("groq").trial_in_flight);
        assert!(breaker.admit("groq").is_none());

        breaker.report_admitted("groq", trial, Outcome::Success);
        assert_eq!(breaker.state("groq"), CircuitState::Closed);
    }

    #[test]
    fn test_stale_trial_cannot_close_a_later_half_open() {
        let (breaker, clock) = breaker(BreakerConfig::default());
        fail(&breaker, "groq", 5);
        clock.advance(Duration::from_secs(60));
        let stale = breaker.admit("groq").expect("first trial");

        breaker.reset("groq");
        fail(&breaker, "groq", 5);
        clock.advance(Duration::from_secs(60));
        let current = breaker.admit("groq").expect("second trial");
        assert_ne!(stale, current);

        breaker.report_admitted("groq", stale, Outcome::Success);
        assert_eq!(breaker.state("groq"), CircuitState::HalfOpen);
        breaker.report_admitted("groq", current, Outcome::TransientError);
        assert_eq!(breaker.state("groq"), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_exactly_one_concurrent_caller() {
        let (breaker, clock) = breaker(BreakerConfig::default());
        fail(&breaker, "groq", 5);
        clock.advance(Duration::from_secs(60));

        let breaker = Arc::new(breaker);
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    breaker.admit("groq").is_some()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().expect("thread should not panic"))
            .filter(|&allowed| allowed)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_disabled_breaker_always_allows() {
        let config = BreakerConfig {
            enabled: false,
            ..Default::default()
        };
        let (breaker, _) = breaker(config);
        fail(&breaker, "groq", 50);
        assert!(breaker.admit("groq").is_some());
    }

    #[test]
    fn test_reset_closes_circuit() {
        let (breaker, _) = breaker(BreakerConfig::default());
        fail(&breaker, "groq", 5);
        assert!(breaker.admit("groq").is_none());

        breaker.reset("groq");
        assert!(breaker.admit("groq").is_some());
    }

    #[test]
    fn test_providers_are_independent() {
        let (breaker, _) = breaker(BreakerConfig::default());
        fail(&breaker, "groq", 5);

        assert!(breaker.admit("groq").is_none());
        assert!(breaker.admit("cohere").is_some());
    }
}
