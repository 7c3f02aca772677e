//! Circuit Breaker
//!
//! Per-dependency fail-fast guard. Lock-free: admission and outcome recording
//! use atomic loads and CAS, never a mutex.
//!
//! # State Transitions
//!
//! ```text
//! CLOSED → OPEN:       consecutive_failures >= threshold within the window
//! OPEN → HALF_OPEN:    cooldown elapsed since opening
//! HALF_OPEN → CLOSED:  trial call succeeds (counters reset)
//! HALF_OPEN → OPEN:    trial call fails (cooldown timer reset)
//! ```
//!
//! Exactly one trial call is admitted in HALF_OPEN; concurrent callers that
//! observe HALF_OPEN while the trial is outstanding are refused as if OPEN.
//! Refusals never touch the failure counters.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::core_types::{TimestampMs, now_ms};

/// Breaker state (encoded as u32 for atomic storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum BreakerState {
    /// Pass-through; failures counted
    Closed = 0,
    /// Fail fast; no call attempted
    Open = 1,
    /// Exactly one trial call admitted
    HalfOpen = 2,
}

impl BreakerState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Admission decision for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call normally
    Allowed,
    /// Circuit half-open; this caller holds the single trial slot
    Trial,
    /// Fail fast without calling the dependency
    Rejected { retry_after: Duration },
}

/// Breaker tuning
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a trial
    pub cooldown: Duration,
    /// Failures further apart than this restart the consecutive count
    pub observation_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            observation_window: Duration::from_secs(60),
        }
    }
}

/// Snapshot exposed to the health surface
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub dependency: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<TimestampMs>,
    pub opened_at: Option<TimestampMs>,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

/// Per-dependency circuit breaker
pub struct CircuitBreaker {
    dependency: String,
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    /// Epoch millis; 0 means never
    last_failure_at: AtomicI64,
    opened_at: AtomicI64,
    trial_in_flight: AtomicBool,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(dependency: &str, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.to_string(),
            state: AtomicU32::new(BreakerState::Closed as u32),
            consecutive_failures: AtomicU32::new(0),
            last_failure_at: AtomicI64::new(0),
            opened_at: AtomicI64::new(0),
            trial_in_flight: AtomicBool::new(false),
            config,
        }
    }

    /// Current state, transitioning OPEN -> HALF_OPEN if the cooldown has
    /// elapsed.
    pub fn current_state(&self) -> BreakerState {
        self.poll_cooldown();
        BreakerState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Decide admission for one call.
    ///
    /// Rejections do not touch failure counters. A `Trial` admission must be
    /// resolved by `record_success` or `record_failure`.
    pub fn admit(&self) -> Admission {
        self.poll_cooldown();

        match BreakerState::from_u32(self.state.load(Ordering::Acquire)) {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => {
                // Single-trial slot; losers are treated as open
                if self
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_after: self.config.cooldown,
                    }
                }
            }
            BreakerState::Open => Admission::Rejected {
                retry_after: self.remaining_cooldown(),
            },
        }
    }

    /// Record a successful call, closing the circuit and resetting counters.
    pub fn record_success(&self) {
        let prior = self.state.swap(BreakerState::Closed as u32, Ordering::AcqRel);
        self.consecutive_failures.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
        if prior == BreakerState::HalfOpen as u32 {
            info!(dependency = %self.dependency, "circuit closed after trial success");
        }
    }

    /// Record a failed call. Trips the breaker at the threshold; a failed
    /// trial reopens the circuit and restarts the cooldown timer.
    pub fn record_failure(&self) {
        let now = now_ms();
        let state = BreakerState::from_u32(self.state.load(Ordering::Acquire));

        if state == BreakerState::HalfOpen {
            self.state.store(BreakerState::Open as u32, Ordering::Release);
            self.opened_at.store(now, Ordering::Release);
            self.last_failure_at.store(now, Ordering::Release);
            self.trial_in_flight.store(false, Ordering::Release);
            warn!(dependency = %self.dependency, "trial failed, circuit reopened");
            return;
        }

        // Failures further apart than the window are not consecutive
        let previous = self.last_failure_at.swap(now, Ordering::AcqRel);
        let windowed = previous > 0
            && now.saturating_sub(previous) <= self.config.observation_window.as_millis() as i64;
        let count = if windowed {
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.consecutive_failures.store(1, Ordering::Release);
            1
        };

        if count >= self.config.failure_threshold
            && self
                .state
                .compare_exchange(
                    BreakerState::Closed as u32,
                    BreakerState::Open as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.opened_at.store(now, Ordering::Release);
            warn!(
                dependency = %self.dependency,
                failures = count,
                "circuit opened"
            );
        }
    }

    /// Give back a `Trial` admission without recording an outcome.
    ///
    /// For callers that fail before reaching the dependency; the slot
    /// reopens for the next caller.
    pub fn abandon_trial(&self) {
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Snapshot for health reporting
    pub fn snapshot(&self) -> CircuitBreakerState {
        let last_failure = self.last_failure_at.load(Ordering::Acquire);
        let opened = self.opened_at.load(Ordering::Acquire);
        CircuitBreakerState {
            dependency: self.dependency.clone(),
            state: self.current_state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            last_failure_at: (last_failure > 0).then_some(last_failure),
            opened_at: (opened > 0).then_some(opened),
            failure_threshold: self.config.failure_threshold,
            cooldown_ms: self.config.cooldown.as_millis() as u64,
        }
    }

    /// OPEN -> HALF_OPEN once the cooldown has elapsed; one caller wins the
    /// CAS, every caller observes the result.
    fn poll_cooldown(&self) {
        if self.state.load(Ordering::Acquire) != BreakerState::Open as u32 {
            return;
        }
        let opened = self.opened_at.load(Ordering::Acquire);
        if now_ms().saturating_sub(opened) >= self.config.cooldown.as_millis() as i64
            && self
                .state
                .compare_exchange(
                    BreakerState::Open as u32,
                    BreakerState::HalfOpen as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.trial_in_flight.store(false, Ordering::Release);
            info!(dependency = %self.dependency, "circuit half-open");
        }
    }

    fn remaining_cooldown(&self) -> Duration {
        let opened = self.opened_at.load(Ordering::Acquire);
        let elapsed = now_ms().saturating_sub(opened);
        let cooldown = self.config.cooldown.as_millis() as i64;
        Duration::from_millis(cooldown.saturating_sub(elapsed).max(0) as u64)
    }
}

/// Registry owning one breaker per dependency name
///
/// Explicit injected state; there is no process-wide status map.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Breaker for a dependency, created on first use
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config)))
            .clone()
    }

    /// State of a dependency's breaker, if one exists
    pub fn current_state(&self, dependency: &str) -> Option<BreakerState> {
        self.breakers
            .get(dependency)
            .map(|breaker| breaker.current_state())
    }

    /// Snapshots of every breaker, for the health surface
    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<CircuitBreakerState> = self
            .breakers
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        states.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        states
    }
}
