//! Resilience patterns for tollgate-runtime.
//!
//! This module provides:
//! - Circuit breaker to prevent cascade failures
//! - Retry with backoff that stops once the breaker opens
//! - A registry holding one breaker per dependency

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError,
    CircuitState, FailurePredicate,
};
pub use registry::BreakerRegistry;
pub use retry::{RetryError, RetryExecutor, TerminalRetryFailure};
