//! Circuit breaker guarding one learning loop.
//!
//! An unhealthy loop trips its own breaker and stops taking work; the other
//! loops keep running. Standard closed / open / half-open lifecycle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use arbiter_types::phi::{fibonacci, PHI_INV_2};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, work flows through.
    Closed,
    /// Tripped, work is skipped until the cooldown elapses.
    Open,
    /// Probing whether the loop has recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning. Defaults: trip after F(5) = 5 consecutive failures,
/// cool down for φ⁻² of a minute (~22.9 s), close again after 2 probes.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: fibonacci(5) as u32,
            success_threshold: 2,
            cooldown: Duration::from_secs_f64(PHI_INV_2 * 60.0),
        }
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
}

/// Circuit breaker for a single learning loop.
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: RwLock<Inner>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
            }),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> CircuitState {
        self.check_cooldown();
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// True when the loop may take work.
    pub fn allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    info!(loop_name = self.name, "Learning loop breaker closing after recovery");
                    Self::transition(
                        &mut inner,
                        CircuitState::Closed,
                        &self.failure_count,
                        &self.success_count,
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        loop_name = self.name,
                        failures = failures,
                        "Learning loop breaker opening"
                    );
                    Self::transition(
                        &mut inner,
                        CircuitState::Open,
                        &self.failure_count,
                        &self.success_count,
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(loop_name = self.name, "Learning loop breaker re-opening after probe failure");
                Self::transition(
                    &mut inner,
                    CircuitState::Open,
                    &self.failure_count,
                    &self.success_count,
                );
            }
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            name: self.name,
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
        }
    }

    fn check_cooldown(&self) {
        let opened_at = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match (inner.state, inner.opened_at) {
                (CircuitState::Open, Some(at)) => at,
                _ => return,
            }
        };
        if opened_at.elapsed() < self.config.cooldown {
            return;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.state == CircuitState::Open {
            info!(loop_name = self.name, "Learning loop breaker half-open after cooldown");
            Self::transition(
                &mut inner,
                CircuitState::HalfOpen,
                &self.failure_count,
                &self.success_count,
            );
        }
    }

    fn transition(
        inner: &mut Inner,
        new_state: CircuitState,
        failures: &AtomicU32,
        successes: &AtomicU32,
    ) {
        inner.state = new_state;
        match new_state {
            CircuitState::Closed => {
                failures.store(0, Ordering::SeqCst);
                successes.store(0, Ordering::SeqCst);
                inner.opened_at = None;
            }
            CircuitState::Open => {
                successes.store(0, Ordering::SeqCst);
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                successes.store(0, Ordering::SeqCst);
            }
        }
    }
}

/// Snapshot of one loop breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: &'static str,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}
