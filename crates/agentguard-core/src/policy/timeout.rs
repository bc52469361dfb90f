//! Deadlines for remote calls.
//!
//! Two flavours:
//! - [`with_timeout`] races an arbitrary operation against a timer. The
//!   caller's wait ends at the deadline, but the operation is not cancelled:
//!   it keeps running detached, and any side effects it performs (a write, an
//!   install) may still land after the caller saw a [`TimeoutError`].
//! - [`create_timeout_controller`] hands out a [`CancellationToken`] that
//!   fires at the deadline, for operations that can abort cooperatively.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{TimeoutError, DEFAULT_TIMEOUT_MESSAGE};

fn timeout_error(message: Option<&str>) -> TimeoutError {
    TimeoutError::new(message.unwrap_or(DEFAULT_TIMEOUT_MESSAGE))
}

/// Wait at most `duration` for `operation` to settle.
///
/// The operation runs as its own tokio task. If it settles first its
/// outcome is returned unchanged (a panic is resumed on the caller). If the
/// deadline passes first, a [`TimeoutError`] carrying `message` (or the
/// default message) is returned and the task is left running.
///
/// Must be called within a tokio runtime.
pub async fn with_timeout<Fut, T, E>(
    operation: Fut,
    duration: Duration,
    message: Option<&str>,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<TimeoutError> + Send + 'static,
{
    let task = tokio::spawn(operation);

    match tokio::time::timeout(duration, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) if join_err.is_panic() => {
            std::panic::resume_unwind(join_err.into_panic())
        }
        // Only reachable when the runtime is shutting down.
        Ok(Err(_)) => Err(E::from(TimeoutError::new("operation cancelled before completion"))),
        Err(_) => {
            tracing::debug!(
                timeout_ms = duration.as_millis() as u64,
                "operation timed out; left running in background"
            );
            Err(E::from(timeout_error(message)))
        }
    }
}

/// Like [`with_timeout`] for futures that cannot be spawned.
///
/// On expiry the future is dropped, which cancels it at its current
/// suspension point.
pub async fn with_timeout_in_place<Fut, T, E>(
    operation: Fut,
    duration: Duration,
    message: Option<&str>,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    match tokio::time::timeout(duration, operation).await {
        Ok(outcome) => outcome,
        Err(_) => Err(E::from(timeout_error(message))),
    }
}

/// A cancellation token that fires on its own after a deadline.
///
/// Created by [`create_timeout_controller`].
#[derive(Debug)]
pub struct TimeoutController {
    token: CancellationToken,
    disarmed: Arc<Mutex<bool>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Arm a controller whose token is cancelled once `duration` elapses,
/// unless [`TimeoutController::cleanup`] runs first.
///
/// Must be called within a tokio runtime.
pub fn create_timeout_controller(duration: Duration) -> TimeoutController {
    let token = CancellationToken::new();
    let disarmed = Arc::new(Mutex::new(false));

    let timer = tokio::spawn({
        let token = token.clone();
        let disarmed = disarmed.clone();
        async move {
            tokio::time::sleep(duration).await;
            let disarmed = disarmed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !*disarmed {
                tracing::debug!(timeout_ms = duration.as_millis() as u64, "deadline reached; aborting");
                token.cancel();
            }
        }
    });

    TimeoutController {
        token,
        disarmed,
        timer: Mutex::new(Some(timer)),
    }
}

impl TimeoutController {
    /// A handle on the abort signal, to pass to the cooperating operation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// `true` once the deadline has fired.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the deadline fires. Never resolves after `cleanup`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `operation` until it settles or the deadline fires, whichever
    /// comes first. On abort the operation is dropped and a
    /// [`TimeoutError`] is returned.
    pub async fn run<Fut, T, E>(&self, operation: Fut, message: Option<&str>) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: From<TimeoutError>,
    {
        tokio::select! {
            biased;
            outcome = operation => outcome,
            _ = self.token.cancelled() => Err(E::from(timeout_error(message))),
        }
    }

    /// Disarm the deadline and release the timer.
    ///
    /// Idempotent. Once this returns, the token will not be cancelled by
    /// this controller.
    pub fn cleanup(&self) {
        *self
            .disarmed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}
