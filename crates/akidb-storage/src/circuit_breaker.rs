//! Circuit breaker in front of cold-store uploads
//!
//! Tracks the error rate of object-store calls over a sliding window and
//! stops the upload pipeline from hammering a store that is down.
//!
//! # States
//!
//! - **Closed:** normal operation, every call allowed
//! - **Open:** error rate exceeded the threshold; calls are deferred until
//!   the cooldown elapses
//! - **HalfOpen:** cooldown over; calls are allowed again and the first
//!   failure reopens the circuit, `half_open_successes` successes close it
//!
//! ```rust
//! use akidb_storage::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//! for _ in 0..10 {
//!     assert!(breaker.should_allow_request());
//!     breaker.record_result(false);
//! }
//! assert_eq!(breaker.state(), CircuitBreakerState::Open);
//! assert!(!breaker.should_allow_request());
//! ```

use akidb_core::{CoreError, CoreResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen
    #[must_use]
    pub fn to_metric(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Put a breaker in front of uploads (default: true)
    pub enabled: bool,

    /// Error rate that trips the circuit, 0.0-1.0 (default: 0.5)
    pub failure_threshold: f64,

    /// Calls in the window before the error rate is trusted (default: 10)
    pub min_requests: usize,

    /// Error rate tracking window (default: 60s)
    pub window_secs: u64,

    /// Time spent Open before calls are let through again (default: 300s)
    pub cooldown_ms: u64,

    /// Consecutive HalfOpen successes that close the circuit (default: 10)
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 0.5,
            min_requests: 10,
            window_secs: 60,
            cooldown_ms: 300_000,
            half_open_successes: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(CoreError::ValidationError(format!(
                "circuit_breaker.failure_threshold must be in (0, 1], got {}",
                self.failure_threshold
            )));
        }
        if self.min_requests == 0 || self.window_secs == 0 || self.half_open_successes == 0 {
            return Err(CoreError::ValidationError(
                "circuit_breaker min_requests, window_secs and half_open_successes must be greater than 0"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitBreakerState,
    /// Call outcomes inside the window (true = success)
    window: VecDeque<(Instant, bool)>,
    last_transition: Instant,
    half_open_successes: u32,
}

impl Inner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn transition(&mut self, state: CircuitBreakerState) {
        self.state = state;
        self.last_transition = Instant::now();
        self.half_open_successes = 0;
    }
}

/// Error-rate circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                window: VecDeque::new(),
                last_transition: Instant::now(),
                half_open_successes: 0,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Error rate over the current window (0.0-1.0).
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.window());
        inner.error_rate()
    }

    /// Whether a call may go out now. An Open circuit whose cooldown has
    /// elapsed moves to HalfOpen and lets the call through.
    #[must_use]
    pub fn should_allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                if inner.last_transition.elapsed() >= self.config.cooldown() {
                    tracing::info!("Circuit breaker half-open, letting uploads through");
                    inner.transition(CircuitBreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time until an Open circuit lets calls through; zero otherwise.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Open => self
                .config
                .cooldown()
                .saturating_sub(inner.last_transition.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Records the outcome of a call that was allowed through.
    pub fn record_result(&self, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.window.push_back((now, success));
        inner.prune(now, self.config.window());

        match inner.state {
            CircuitBreakerState::Closed => {
                let error_rate = inner.error_rate();
                if inner.window.len() >= self.config.min_requests
                    && error_rate > self.config.failure_threshold
                {
                    tracing::warn!(
                        error_rate = error_rate,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker tripped"
                    );
                    inner.transition(CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_successes {
                        tracing::info!(
                            successes = inner.half_open_successes,
                            "Circuit breaker closed"
                        );
                        inner.transition(CircuitBreakerState::Closed);
                        inner.window.clear();
                    }
                } else {
                    tracing::warn!("Circuit breaker half-open call failed, reopening");
                    inner.transition(CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    /// Forces the circuit Closed and forgets the window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitBreakerState::Closed);
        inner.window.clear();
        tracing::info!("Circuit breaker manually reset");
    }
}
