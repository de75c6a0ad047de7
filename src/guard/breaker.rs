use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E: std::fmt::Display> {
    #[error("circuit breaker '{0}' is open")]
    Blocked(String),
    #[error("{0}")]
    Inner(E),
}

impl<E: std::fmt::Display> BreakerError<E> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, BreakerError::Blocked(_))
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub name: String,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a half-open probe is allowed.
    pub cooldown: Duration,
}

impl BreakerConfig {
    /// Preset for database access: trip after 5 consecutive failures,
    /// probe again after 30 seconds.
    pub fn database(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub times_opened: u64,
    pub last_transition_age_ms: u64,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    successes: u64,
    failures: u64,
    times_opened: u64,
    last_transition: Instant,
}

/// Closed/Open/HalfOpen state machine gating calls into a fragile
/// dependency. While Open, calls short-circuit to `Blocked` instead of
/// piling onto a subsystem that is already failing.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                successes: 0,
                failures: 0,
                times_opened: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Run `op` under the breaker. In Open state the call is rejected
    /// without invoking `op`; in Closed/HalfOpen the outcome feeds the
    /// state machine.
    pub fn call<T, E: std::fmt::Display>(
        &self,
        op: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, BreakerError<E>> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Open => {
                    if inner.last_transition.elapsed() >= self.config.cooldown {
                        debug!("breaker '{}' cooldown elapsed, probing half-open", self.config.name);
                        inner.state = BreakerState::HalfOpen;
                        inner.last_transition = Instant::now();
                    } else {
                        return Err(BreakerError::Blocked(self.config.name.clone()));
                    }
                }
                BreakerState::Closed | BreakerState::HalfOpen => {}
            }
        }

        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        BreakerMetrics {
            state: inner.state,
            successes: inner.successes,
            failures: inner.failures,
            consecutive_failures: inner.consecutive_failures,
            times_opened: inner.times_opened,
            last_transition_age_ms: inner.last_transition.elapsed().as_millis() as u64,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_transition = Instant::now();
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.successes += 1;
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            debug!("breaker '{}' closing after successful probe", self.config.name);
            inner.state = BreakerState::Closed;
            inner.last_transition = Instant::now();
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.consecutive_failures += 1;

        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };

        if should_open {
            warn!(
                "breaker '{}' opening after {} consecutive failures",
                self.config.name, inner.consecutive_failures
            );
            inner.state = BreakerState::Open;
            inner.times_opened += 1;
            inner.last_transition = Instant::now();
        }
    }
}
