//! Per-adapter circuit breaker: `closed → open → half-open → closed`.
//!
//! State lives in atomics so concurrent invocations of one adapter never
//! contend on a lock. Times are milliseconds since the breaker's creation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "halfOpen",
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    window_start_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    trial_in_flight: AtomicBool,
    epoch: Instant,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            failures: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
            failure_threshold: config.failure_threshold.max(1),
            window: Duration::from_millis(config.window_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    fn ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn raw_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cooled_down(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.opened_at_ms.load(Ordering::Acquire))
            >= self.cooldown.as_millis() as u64
    }

    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    /// Reported state; an open circuit past its cooldown reads as half-open.
    pub fn state_at(&self, now: Instant) -> CircuitState {
        match self.raw_state() {
            CircuitState::Open if self.cooled_down(self.ms(now)) => CircuitState::HalfOpen,
            s => s,
        }
    }

    /// Whether a call would currently be let through, without claiming it.
    pub fn admits_at(&self, now: Instant) -> bool {
        match self.raw_state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooled_down(self.ms(now)),
            CircuitState::HalfOpen => !self.trial_in_flight.load(Ordering::Acquire),
        }
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        self.claim_at(now).is_some()
    }

    pub fn acquire(&self) -> Option<CallPermit<'_>> {
        self.acquire_at(Instant::now())
    }

    /// Claim one call and get back a permit that must be settled with
    /// `succeed` or `fail`. A half-open trial permit dropped unsettled
    /// reopens the circuit, so an abandoned trial never blocks the adapter.
    pub fn acquire_at(&self, now: Instant) -> Option<CallPermit<'_>> {
        self.claim_at(now).map(|trial| CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Claim permission for one call. In half-open only a single trial call
    /// is admitted until it reports back. `Some(true)` marks that trial.
    fn claim_at(&self, now: Instant) -> Option<bool> {
        match self.raw_state() {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                if !self.cooled_down(self.ms(now)) {
                    return None;
                }
                let moved = self
                    .state
                    .compare_exchange(
                        CircuitState::Open.as_u8(),
                        CircuitState::HalfOpen.as_u8(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if moved {
                    self.trial_in_flight.store(true, Ordering::Release);
                    Some(true)
                } else {
                    // Someone else transitioned first; retry against the new state.
                    self.claim_at(now)
                }
            }
            CircuitState::HalfOpen => self
                .trial_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| true),
        }
    }

    fn abandon_trial_at(&self, now: Instant) {
        if self.raw_state() == CircuitState::HalfOpen {
            self.open(self.ms(now));
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
        self.state
            .store(CircuitState::Closed.as_u8(), Ordering::Release);
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let now_ms = self.ms(now);
        match self.raw_state() {
            CircuitState::HalfOpen => self.open(now_ms),
            CircuitState::Open => {}
            CircuitState::Closed => {
                let window_start = self.window_start_ms.load(Ordering::Acquire);
                let expired =
                    now_ms.saturating_sub(window_start) > self.window.as_millis() as u64;
                let count = if expired || self.failures.load(Ordering::Acquire) == 0 {
                    self.window_start_ms.store(now_ms, Ordering::Release);
                    self.failures.store(1, Ordering::Release);
                    1
                } else {
                    self.failures.fetch_add(1, Ordering::AcqRel) + 1
                };
                if count >= self.failure_threshold {
                    self.open(now_ms);
                }
            }
        }
    }

    fn open(&self, now_ms: u64) {
        self.opened_at_ms.store(now_ms, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
        self.state.store(CircuitState::Open.as_u8(), Ordering::Release);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }
}

/// One admitted call against a `CircuitBreaker`.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            tracing::warn!("[Tools] Half-open trial abandoned; reopening circuit");
            self.breaker.abandon_trial_at(Instant::now());
        }
    }
}
