//! Circuit breaker for upstream providers

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast
    Open,
    /// Probe requests allowed to test recovery
    HalfOpen,
}

/// Circuit breaker guarding one upstream provider
pub struct CircuitBreaker {
    provider: String,
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    /// State and the instant it was entered
    state: RwLock<(CircuitState, Instant)>,
    /// Consecutive failures while closed
    failures: AtomicU32,
    /// Successes while half-open
    successes: AtomicU32,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(provider: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            reset_timeout: config.reset_timeout,
            state: RwLock::new((CircuitState::Closed, Instant::now())),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
        }
    }

    /// Check if a request may be sent upstream
    pub fn can_proceed(&self) -> bool {
        if !self.enabled {
            return true;
        }

        let (state, since) = *self.state.read();
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open if since.elapsed() >= self.reset_timeout => {
                self.transition_to(CircuitState::HalfOpen);
                true
            }
            CircuitState::Open => {
                debug!(provider = %self.provider, "Circuit open, rejecting request");
                false
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }

        match self.state() {
            CircuitState::Closed => self.failures.store(0, Ordering::Relaxed),
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.success_threshold {
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }

        match self.state() {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition_to(CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.state.read().0
    }

    fn transition_to(&self, new_state: CircuitState) {
        let mut state = self.state.write();
        if state.0 == new_state {
            return;
        }
        *state = (new_state, Instant::now());

        match new_state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
                self.successes.store(0, Ordering::Relaxed);
                info!(provider = %self.provider, "Circuit breaker closed");
            }
            CircuitState::Open => {
                warn!(
                    provider = %self.provider,
                    failures = self.failures.load(Ordering::Relaxed),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                self.successes.store(0, Ordering::Relaxed);
                debug!(provider = %self.provider, "Circuit breaker half-open");
            }
        }
    }
}
