//! Error types raised by the resilience primitives.

use std::time::Duration;

use thiserror::Error;

/// Default message carried by a [`TimeoutError`].
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "Operation timed out";

/// The guarded operation did not settle before its deadline.
///
/// The operation itself may still be running: a timed-out write can
/// complete after this error has been returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TimeoutError {
    pub message: String,
}

impl TimeoutError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for TimeoutError {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_MESSAGE)
    }
}

/// The breaker is open and its cool-down has not elapsed, so the
/// operation was never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker open for {name} (retry in {}ms)", .retry_after.as_millis())]
pub struct CircuitOpenError {
    /// Name of the dependency the breaker protects.
    pub name: String,
    /// Remaining cool-down before a probe will be let through.
    pub retry_after: Duration,
}

/// Ready-made error type for callers without one of their own.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Fast-failed by an open circuit breaker.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The attempt exceeded its deadline.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// Transport-level failure (connection refused, reset, DNS, ...).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The remote answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl GuardError {
    /// Returns `true` if another attempt may succeed.
    ///
    /// An open circuit is not retryable: retrying immediately would only
    /// collect more fast-fails during the cool-down.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::CircuitOpen(_) | Self::Other(_) => false,
        }
    }

    /// Returns `true` for failures a service should answer with a degraded
    /// response (cached data, 503 + Retry-After) rather than a generic 500.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::CircuitOpen(_) | Self::Timeout(_))
    }

    /// Suggested `Retry-After` for degraded responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen(e) => Some(e.retry_after),
            _ => None,
        }
    }
}
