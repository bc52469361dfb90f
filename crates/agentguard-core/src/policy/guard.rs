//! The full policy stack for one dependency.
//!
//! ```text
//! call(op) → [RetryPolicy] → [with_timeout] → [CircuitBreaker] → op
//! ```
//!
//! Every attempt passes through the breaker and gets its own deadline. A
//! timed-out attempt keeps running in the background and its eventual
//! outcome is still recorded by the breaker.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CircuitOpenError, TimeoutError};
use crate::policy::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::policy::registry::CircuitBreakerRegistry;
use crate::policy::retry::{RetryConfig, RetryPolicy};
use crate::policy::timeout::with_timeout;

/// Configuration for a [`Guard`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// Deadline for each individual attempt.
    #[serde(rename = "timeout_ms", with = "crate::serde_ms")]
    pub timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Breaker + per-attempt timeout + retry, composed in that order.
#[derive(Debug, Clone)]
pub struct Guard {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
    timeout_message: Option<String>,
}

impl Guard {
    pub fn new(breaker: CircuitBreaker, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            breaker,
            retry,
            timeout,
            timeout_message: None,
        }
    }

    /// Build a guard for dependency `name`, sharing its breaker with every
    /// other user of `registry`.
    pub fn from_registry(registry: &CircuitBreakerRegistry, name: &str, config: &GuardConfig) -> Self {
        let breaker = registry.get(name, Some(config.circuit_breaker.clone()));
        Self::new(breaker, RetryPolicy::new(config.retry.clone()), config.timeout)
    }

    /// Message carried by the `TimeoutError` of a timed-out attempt.
    pub fn with_timeout_message(mut self, message: impl Into<String>) -> Self {
        self.timeout_message = Some(message.into());
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` through the stack, retrying every error.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<CircuitOpenError> + From<TimeoutError> + Display + Send + 'static,
    {
        self.call_if(f, |_: &E| true).await
    }

    /// Run `f` through the stack, retrying only errors `is_retryable`
    /// accepts.
    pub async fn call_if<F, Fut, T, E, P>(&self, mut f: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<CircuitOpenError> + From<TimeoutError> + Display + Send + 'static,
        P: Fn(&E) -> bool,
    {
        let breaker = &self.breaker;
        let timeout = self.timeout;
        let message = self.timeout_message.as_deref();

        self.retry
            .execute_if(
                || {
                    let breaker = breaker.clone();
                    let operation = f();
                    with_timeout(
                        async move { breaker.execute(move || operation).await },
                        timeout,
                        message,
                    )
                },
                is_retryable,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardError;
    use crate::policy::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn guard(registry: &CircuitBreakerRegistry, threshold: u32, attempts: u32) -> Guard {
        Guard::from_registry(
            registry,
            "agent",
            &GuardConfig {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: threshold,
                    reset_timeout: Duration::from_secs(30),
                    success_threshold: 1,
                },
                retry: RetryConfig {
                    max_attempts: attempts,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                    ..Default::default()
                },
                timeout: Duration::from_millis(50),
            },
        )
    }

    #[test]
    fn config_from_json() {
        let config: GuardConfig = serde_json::from_str(
            r#"{"timeout_ms": 2000, "retry": {"max_attempts": 2}, "circuit_breaker": {"failure_threshold": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_through_breaker() {
        let registry = CircuitBreakerRegistry::new();
        let g = guard(&registry, 5, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let value = g
            .call(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GuardError::Http("connection reset".into()))
                    } else {
                        Ok("up")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "up");
        let stats = g.breaker().stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn each_attempt_gets_its_own_deadline() {
        let registry = CircuitBreakerRegistry::new();
        let g = guard(&registry, 5, 2).with_timeout_message("agent did not answer");
        let start = tokio::time::Instant::now();

        let err = g
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, GuardError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "agent did not answer");
        // 50ms attempt, 10ms backoff, 50ms attempt.
        assert_eq!(start.elapsed(), Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_attempts() {
        let registry = CircuitBreakerRegistry::new();
        let g = guard(&registry, 2, 4);
        let calls = Arc::new(AtomicU32::new(0));

        let err = g
            .call_if(
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(GuardError::Http("refused".into()))
                    }
                },
                GuardError::is_retryable,
            )
            .await
            .unwrap_err();

        // Two real failures open the breaker; the third attempt fast-fails
        // and an open circuit is not retryable.
        assert!(matches!(err, GuardError::CircuitOpen(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.get("agent", None).state(), CircuitState::Open);
    }
}
