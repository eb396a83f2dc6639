//! Circuit breaker around the CRM API. Explicitly constructed and injected;
//! the process-wide instance is just an `Arc` shared through state.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use pixel_core::clock::SharedClock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests pass through.
    Closed,
    /// Too many failures; requests fail fast.
    Open,
    /// Probing recovery; limited requests allowed.
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before admitting a probe.
    pub open_duration_secs: u64,
    /// Consecutive probe successes that close the circuit.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_secs: 60,
            half_open_successes: 2,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    state: parking_lot::Mutex<CircuitState>,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    opened_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: parking_lot::Mutex::new(CircuitState::Closed),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            opened_at: parking_lot::Mutex::new(None),
        }
    }

    /// Whether a request may go out. An open circuit past its reset
    /// deadline transitions to half-open and admits the probe.
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened = self.opened_at.lock();
                if let Some(opened_at) = *opened {
                    let elapsed = (self.clock.now() - opened_at).num_seconds();
                    if elapsed >= self.config.open_duration_secs as i64 {
                        *state = CircuitState::HalfOpen;
                        self.success_count.store(0, Ordering::Relaxed);
                        info!("circuit breaker transitioning to half-open");
                        metrics::counter!("crm.breaker_half_open").increment(1);
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.half_open_successes as u64 {
                    *state = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                    info!("circuit breaker closed after recovery");
                    metrics::counter!("crm.breaker_closed").increment(1);
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold as u64 {
                    *state = CircuitState::Open;
                    *self.opened_at.lock() = Some(self.clock.now());
                    warn!(failures = count, "circuit breaker opened");
                    metrics::counter!("crm.breaker_opened").increment(1);
                }
            }
            CircuitState::HalfOpen => {
                // A failed probe goes straight back to open.
                *state = CircuitState::Open;
                *self.opened_at.lock() = Some(self.clock.now());
                self.success_count.store(0, Ordering::Relaxed);
                warn!("circuit breaker re-opened from half-open");
                metrics::counter!("crm.breaker_opened").increment(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }
}
