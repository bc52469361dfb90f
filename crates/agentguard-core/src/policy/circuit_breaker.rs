//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      failure count reaches `failure_threshold`
//! - `Open` → `Half-Open`:   `reset_timeout` has elapsed, on the next `execute`
//! - `Half-Open` → `Closed`: `success_threshold` probes succeed
//! - `Half-Open` → `Open`:   any single probe fails
//!
//! There is no terminal state. A breaker monitors its dependency for the
//! lifetime of the process.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::{default_clock, Clock};
use crate::error::CircuitOpenError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until `reset_timeout` has elapsed.
    Open,
    /// Probe requests let through to test whether the dependency recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening.
    pub failure_threshold: u32,
    /// How long to stay open before letting a probe through.
    #[serde(rename = "reset_timeout_ms", with = "crate::serde_ms")]
    pub reset_timeout: Duration,
    /// Number of successful half-open probes before closing.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Called with `(old, new)` on every state transition.
pub type StateObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failures: u32,
    /// Successful probes in the current half-open window.
    pub successes: u32,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Instant>,
    pub total_requests: u64,
    pub total_failures: u64,
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
}

/// `(from, to, consecutive failures)` captured under the state lock.
type Transition = Option<(CircuitState, CircuitState, u32)>;

/// Thread-safe circuit breaker.
///
/// Clones are handles onto the same state, so every call site holding a
/// clone sees the same view of the dependency's health.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    observer: Option<StateObserver>,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            clock: default_clock(),
            observer: None,
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                last_success_at: None,
                next_attempt_at: None,
                total_requests: 0,
                total_failures: 0,
            })),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Install a state-change observer.
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// `true` if both handles share the same breaker state.
    pub fn ptr_eq(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current state. Does not perform the Open → Half-Open transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `f` through the breaker.
    ///
    /// While open and cooling down, `f` is never called and a
    /// [`CircuitOpenError`] is returned instead. Otherwise the outcome of
    /// `f` is recorded and returned unchanged.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.admit().map_err(E::from)?;

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Predicts whether `execute` would let a call through right now.
    ///
    /// Unlike `execute`, this never moves an expired open circuit to
    /// half-open.
    pub fn is_available(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner
                .next_attempt_at
                .map_or(true, |at| self.clock.now() >= at),
        }
    }

    /// Snapshot of the breaker's counters.
    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        CircuitStats {
            state: inner.state,
            failures: inner.failure_count,
            successes: inner.success_count,
            last_failure: inner.last_failure_at,
            last_success: inner.last_success_at,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
        }
    }

    /// Administrative override of the current state.
    pub fn force_state(&self, state: CircuitState) {
        let now = self.clock.now();
        let change = {
            let mut inner = self.lock();
            match state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt_at = None;
                }
                CircuitState::Open => {
                    inner.next_attempt_at = Some(now + self.config.reset_timeout);
                }
                CircuitState::HalfOpen => {
                    inner.success_count = 0;
                }
            }
            Self::transition(&mut inner, state)
        };
        self.notify(change);
    }

    /// Count the request and decide whether it may proceed.
    fn admit(&self) -> Result<(), CircuitOpenError> {
        let now = self.clock.now();
        let change = {
            let mut inner = self.lock();
            inner.total_requests += 1;

            if inner.state != CircuitState::Open {
                return Ok(());
            }
            match inner.next_attempt_at {
                Some(at) if now < at => {
                    return Err(CircuitOpenError {
                        name: self.name.to_string(),
                        retry_after: at - now,
                    });
                }
                _ => {
                    inner.success_count = 0;
                    Self::transition(&mut inner, CircuitState::HalfOpen)
                }
            }
        };
        self.notify(change);
        Ok(())
    }

    fn on_success(&self) {
        let now = self.clock.now();
        let change = {
            let mut inner = self.lock();
            inner.last_success_at = Some(now);
            inner.failure_count = 0;

            if inner.state == CircuitState::HalfOpen {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.next_attempt_at = None;
                    Self::transition(&mut inner, CircuitState::Closed)
                } else {
                    None
                }
            } else {
                None
            }
        };
        self.notify(change);
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let change = {
            let mut inner = self.lock();
            inner.last_failure_at = Some(now);
            inner.failure_count += 1;
            inner.total_failures += 1;

            let trip = match inner.state {
                // Probe failed: no threshold counting while half-open.
                CircuitState::HalfOpen => true,
                CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
                CircuitState::Open => false,
            };
            if trip {
                inner.next_attempt_at = Some(now + self.config.reset_timeout);
                Self::transition(&mut inner, CircuitState::Open)
            } else {
                None
            }
        };
        self.notify(change);
    }

    fn transition(inner: &mut CircuitInner, to: CircuitState) -> Transition {
        let from = inner.state;
        inner.state = to;
        (from != to).then_some((from, to, inner.failure_count))
    }

    /// Log and publish a transition. Runs after the state lock is released
    /// so observers may call back into the breaker.
    fn notify(&self, change: Transition) {
        let Some((from, to, failures)) = change else {
            return;
        };
        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, %from, failures, "Circuit breaker → open");
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, %from, "Circuit breaker → half-open");
            }
            CircuitState::Closed => {
                tracing::info!(breaker = %self.name, %from, "Circuit breaker → closed");
            }
        }
        if let Some(observer) = &self.observer {
            observer(from, to);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
