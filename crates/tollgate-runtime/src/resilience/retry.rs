//! Retry with backoff, coordinated with a circuit breaker.
//!
//! Every attempt goes through the breaker. After a failed attempt the breaker
//! is consulted before sleeping: once it has opened, retrying would only be
//! rejected, so the loop stops immediately.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tollgate_core::RetryPolicy;

use super::circuit_breaker::{BreakerError, CircuitBreaker, CircuitOpenError, CircuitState};

/// All attempts failed.
#[derive(Debug, Error)]
#[error("'{operation}' failed after {attempts} attempts: {last_error}")]
pub struct TerminalRetryFailure<E> {
    /// Name of the breaker the attempts went through
    pub operation: String,

    /// Attempts made, including the first
    pub attempts: u32,

    /// Error from the final attempt
    #[source]
    pub last_error: E,
}

/// Error returned by [`RetryExecutor::run`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The breaker rejected the call, or opened while retrying.
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),

    /// Every allowed attempt failed.
    #[error(transparent)]
    Exhausted(TerminalRetryFailure<E>),

    /// The operation failed with an error that does not count against the
    /// dependency. These are definitive and never retried.
    #[error(transparent)]
    Rejected(E),
}

/// Runs operations through a breaker under a retry policy.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self { breaker, policy }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `operation`, retrying dependency failures per the policy.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        let mut attempt: u32 = 1;

        loop {
            let err = match self.breaker.protect(&mut operation).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            breaker = %self.breaker.name(),
                            attempt,
                            "Call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(BreakerError::Open(open)) => return Err(RetryError::CircuitOpen(open)),
                Err(BreakerError::Inner(err)) => err,
            };

            if !self.breaker.counts_as_failure(&err) {
                return Err(RetryError::Rejected(err));
            }

            if self.breaker.state() == CircuitState::Open {
                tracing::warn!(
                    breaker = %self.breaker.name(),
                    attempt,
                    error = %err,
                    "Circuit opened; abandoning retries"
                );
                return Err(RetryError::CircuitOpen(self.breaker.open_error()));
            }

            match self.policy.delay_after(attempt) {
                Some(delay) => {
                    tracing::debug!(
                        breaker = %self.breaker.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    tracing::warn!(
                        breaker = %self.breaker.name(),
                        attempts = attempt,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(RetryError::Exhausted(TerminalRetryFailure {
                        operation: self.breaker.name().to_string(),
                        attempts: attempt,
                        last_error: err,
                    }));
                }
            }
        }
    }
}
