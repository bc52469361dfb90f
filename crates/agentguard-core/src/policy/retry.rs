//! Exponential backoff retry policy with optional jitter.
//!
//! Delay before the retry following attempt `n` (0-based):
//! `min(base_delay * multiplier^n, max_delay)`, plus up to
//! `jitter_fraction * delay` of random jitter. With the defaults
//! (`multiplier = 2.0`, no jitter) that is 100ms, 200ms, 400ms, ...

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::{default_clock, Clock};

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, counting the first one. `0` is treated as `1`.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(rename = "base_delay_ms", with = "crate::serde_ms")]
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(rename = "max_delay_ms", with = "crate::serde_ms")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Add up to `jitter_fraction * delay` random jitter (0.0 = no jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        }
    }
}

/// Retry executor: computes delays and drives attempts.
#[derive(Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            clock: default_clock(),
        }
    }

    /// Sleep through `clock` instead of tokio's timer.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Effective attempt budget.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Returns the delay after the failed attempt at `attempt_index`
    /// (0-based).
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let cap = self.config.max_delay;
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let nanos =
            self.config.base_delay.as_nanos() as f64 * self.config.multiplier.powi(exponent);
        let delay = if nanos.is_finite() && nanos < cap.as_nanos() as f64 {
            Duration::from_nanos(nanos.max(0.0).round() as u64)
        } else {
            cap
        };

        let jitter = if self.config.jitter_fraction > 0.0 && !delay.is_zero() {
            let fraction = rand::thread_rng().gen_range(0.0..self.config.jitter_fraction);
            Duration::from_nanos((delay.as_nanos() as f64 * fraction) as u64)
        } else {
            Duration::ZERO
        };

        delay.saturating_add(jitter)
    }

    /// Run `f` until it succeeds or the attempt budget is spent, retrying
    /// every error.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_if(f, |_: &E| true).await
    }

    /// Run `f` until it succeeds, the attempt budget is spent, or
    /// `is_retryable` rejects an error. The last error is returned as is.
    pub async fn execute_if<F, Fut, T, E, P>(&self, mut f: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0u32;
        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempt += 1;

            if !is_retryable(&err) {
                tracing::debug!(attempt, error = %err, "error not retryable");
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::debug!(attempt, error = %err, "retry attempts exhausted");
                return Err(err);
            }

            let delay = self.delay_for(attempt - 1);
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            self.clock.sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish()
    }
}

/// Retry `f` under `config`, treating every error as retryable.
pub async fn with_retry<F, Fut, T, E>(f: F, config: RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    RetryPolicy::new(config).execute(f).await
}
