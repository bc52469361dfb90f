//! Policy engine: composable primitives for calling unreliable dependencies.
//!
//! The policy stack (outermost first):
//! ```text
//! Call → [RetryPolicy] → [with_timeout] → [CircuitBreaker] → Operation
//! ```
//!
//! The breaker skips the operation entirely while open, the timeout bounds
//! each attempt, and the retry policy decides how many attempts are made.

pub mod circuit_breaker;
pub mod guard;
pub mod registry;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats, StateObserver,
};
pub use guard::{Guard, GuardConfig};
pub use registry::{CircuitBreakerRegistry, RegistryObserver};
pub use retry::{with_retry, RetryConfig, RetryPolicy};
pub use timeout::{create_timeout_controller, with_timeout, with_timeout_in_place, TimeoutController};
