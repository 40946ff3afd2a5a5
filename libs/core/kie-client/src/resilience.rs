//! Circuit breaker fronting every provider call.
//!
//! States: closed -> open (after `failure_threshold` consecutive failures)
//! -> half-open (after `timeout`) -> closed (after `success_threshold`
//! consecutive successes). Open-state rejections carry the time remaining
//! until the next probe so the user message can name an ETA.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in half-open before closing
    pub success_threshold: u32,
    /// How long to stay open before probing
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().expect("breaker state poisoned")
    }

    /// Check whether a call may proceed.
    ///
    /// In open state returns the time remaining until the next probe; when
    /// the timeout has elapsed the breaker moves to half-open and admits the
    /// call.
    pub fn check(&self) -> Result<(), Duration> {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened_at = *self.opened_at.read().expect("breaker state poisoned");
                let elapsed = opened_at.map(|at| at.elapsed()).unwrap_or(self.config.timeout);
                if elapsed >= self.config.timeout {
                    self.transition(CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(self.config.timeout - elapsed)
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                self.transition(CircuitState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                self.open();
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self) {
        *self.opened_at.write().expect("breaker state poisoned") = Some(Instant::now());
        self.transition(CircuitState::Open);
    }

    fn transition(&self, next: CircuitState) {
        let mut state = self.state.write().expect("breaker state poisoned");
        if *state == next {
            return;
        }
        *state = next;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        observability::set_breaker_state(next.as_gauge());
        match next {
            CircuitState::Open => warn!(timeout_s = %self.config.timeout.as_secs(), "Circuit breaker OPENED"),
            CircuitState::HalfOpen => info!("Circuit breaker HALF-OPEN (probing)"),
            CircuitState::Closed => info!("Circuit breaker CLOSED (recovered)"),
        }
    }
}
