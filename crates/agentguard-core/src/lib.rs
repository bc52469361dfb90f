//! agentguard-core: resilience primitives for calls to remote dependencies.
//!
//! # Overview
//!
//! Service code that talks to remote agent servers, health endpoints or
//! tool installers wraps each call in a small set of composable policies:
//!
//! - [`CircuitBreaker`]: fails fast once a dependency keeps failing, and
//!   lets probes through after a cool-down
//! - [`CircuitBreakerRegistry`]: one shared breaker per dependency name
//! - [`with_timeout`] / [`create_timeout_controller`]: per-attempt deadlines
//! - [`with_retry`] / [`RetryPolicy`]: capped exponential backoff
//! - [`Guard`]: all of the above composed as
//!   `retry(timeout(breaker.execute(op)))`
//!
//! Errors raised by the wrapped operation always come back unchanged. The
//! policies add only [`CircuitOpenError`] and [`TimeoutError`], which they
//! convert into the caller's error type through `From`.
//!
//! ```rust,ignore
//! use agentguard_core::{CircuitBreakerRegistry, Guard, GuardConfig, GuardError};
//!
//! let registry = CircuitBreakerRegistry::new();
//! let guard = Guard::from_registry(&registry, "agent-eu-1", &GuardConfig::default());
//! let status = guard
//!     .call_if(|| probe(url.clone()), GuardError::is_retryable)
//!     .await?;
//! ```

pub mod clock;
pub mod error;
pub mod policy;
pub mod serde_ms;

pub use clock::{Clock, ManualClock, TokioClock};
pub use error::{CircuitOpenError, GuardError, TimeoutError};
pub use policy::{
    create_timeout_controller, with_retry, with_timeout, with_timeout_in_place, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStats, Guard, GuardConfig,
    RetryConfig, RetryPolicy, TimeoutController,
};
