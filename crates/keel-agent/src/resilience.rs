//! Retry and circuit-breaker decorators.
//!
//! Both wrap an arbitrary async operation and compose independently:
//!
//! ```text
//! breaker.call(|| retry.run(|| control_plane.report(..)))
//! ```
//!
//! Only errors classified as [`Transient`] are retried or counted
//! against the breaker. A terminal error means the remote side answered,
//! which says nothing about its health.

use std::fmt::Display;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use keel_sync::Transient;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `step * attempt`, capped at `max`.
    Linear { step: Duration, max: Duration },
    /// `initial * 2^(attempt - 1)`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Linear { step, max } => step.saturating_mul(attempt).min(max),
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(200),
                max: Duration::from_secs(10),
            },
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    debug!(attempt, ?delay, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Observable breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { probing: bool },
}

#[derive(Debug, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// Rejected without calling the operation.
    Open { retry_after: Duration },
    Inner(E),
}

impl<E: Display> Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open { retry_after } => {
                write!(f, "circuit open, retry after {retry_after:?}")
            }
            BreakerError::Inner(e) => e.fmt(f),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Inner::Open { until } = *state
            && Instant::now() >= until
        {
            *state = Inner::HalfOpen { probing: false };
        }
        match *state {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient,
    {
        self.acquire::<E>()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_transient() {
                    self.on_failure();
                } else {
                    self.on_success();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn acquire<E>(&self) -> Result<(), BreakerError<E>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *state {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { until } if now < until => Err(BreakerError::Open {
                retry_after: until - now,
            }),
            Inner::Open { .. } | Inner::HalfOpen { probing: false } => {
                debug!(breaker = %self.name, "half-open, probing");
                *state = Inner::HalfOpen { probing: true };
                Ok(())
            }
            Inner::HalfOpen { probing: true } => Err(BreakerError::Open {
                retry_after: self.config.cooldown,
            }),
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, Inner::Closed { failures: 0 }) {
            if matches!(*state, Inner::HalfOpen { .. }) {
                info!(breaker = %self.name, "circuit closed");
            }
            *state = Inner::Closed { failures: 0 };
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let until = Instant::now() + self.config.cooldown;
        match *state {
            Inner::Closed { failures } if failures + 1 >= self.config.failure_threshold => {
                warn!(
                    breaker = %self.name,
                    failures = failures + 1,
                    cooldown = ?self.config.cooldown,
                    "circuit opened"
                );
                *state = Inner::Open { until };
            }
            Inner::Closed { failures } => *state = Inner::Closed {
                failures: failures + 1,
            },
            Inner::HalfOpen { .. } => {
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
                *state = Inner::Open { until };
            }
            Inner::Open { .. } => {}
        }
    }
}
