//! Circuit breaker to prevent cascade failures.
//!
//! When calls to a dependency fail repeatedly, the circuit opens and
//! subsequent calls are rejected without touching the dependency until the
//! recovery timeout has passed. The next call after that is a single probe:
//! success closes the circuit, failure reopens it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time after the last failure before a probe is allowed
    #[serde(with = "tollgate_core::duration_serde")]
    pub recovery_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create a configuration.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Preset for external HTTP APIs.
    pub fn for_api_calls() -> Self {
        Self::new(3, Duration::from_secs(60))
    }

    /// Preset for databases: more tolerant, recovers sooner.
    pub fn for_database() -> Self {
        Self::new(5, Duration::from_secs(30))
    }

    /// Preset for transcription and language-model services, which are
    /// expensive to call and slow to recover.
    pub fn for_ai_services() -> Self {
        Self::new(2, Duration::from_secs(120))
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::for_api_calls()
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls are rejected without invoking the dependency
    Open,

    /// One probe call is testing whether the dependency recovered
    HalfOpen,
}

/// The breaker rejected a call without invoking the operation.
#[derive(Debug, Clone, Error)]
#[error("circuit '{breaker}' is open")]
pub struct CircuitOpenError {
    /// Name of the breaker (the protected dependency)
    pub breaker: String,

    /// Time left until a probe is allowed, if known
    pub retry_after: Option<Duration>,
}

/// Error returned by [`CircuitBreaker::protect`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The call was rejected; the operation never ran.
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    /// The operation ran and failed; the error is passed through unchanged.
    #[error(transparent)]
    Inner(E),
}

/// Decides whether an error counts against the dependency.
pub type FailurePredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    #[serde(with = "tollgate_core::duration_serde")]
    pub recovery_timeout: Duration,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

impl BreakerSnapshot {
    /// Share of admitted calls that succeeded, between 0.0 and 1.0.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.successful_calls as f64 / self.total_calls as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    forced_open: bool,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            probe_in_flight: false,
            forced_open: false,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
        }
    }
}

/// Circuit breaker guarding one dependency.
///
/// Each dependency owns its own breaker so failure domains stay independent.
/// The state lock is only held for the transition itself, never while the
/// protected operation runs.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    is_failure: FailurePredicate,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker that counts every error as a dependency failure.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            is_failure: Arc::new(|_: &(dyn StdError + 'static)| true),
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Replace the failure classification.
    pub fn with_failure_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    /// Classify errors of type `E` with `predicate`; errors of other types
    /// still count as failures.
    pub fn counting<E, F>(self, predicate: F) -> Self
    where
        E: StdError + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.with_failure_predicate(move |err| err.downcast_ref::<E>().map_or(true, &predicate))
    }

    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether `err` counts against the dependency.
    pub fn counts_as_failure(&self, err: &(dyn StdError + 'static)) -> bool {
        (self.is_failure)(err)
    }

    /// Run `operation` under the breaker.
    ///
    /// Rejects with [`BreakerError::Open`] while the circuit is open. Errors
    /// from the operation are returned unchanged in [`BreakerError::Inner`].
    pub async fn protect<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        let admission = self.admit()?;
        let mut probe = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let result = operation().await;
        probe.armed = false;

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(err) => {
                if self.counts_as_failure(&err) {
                    self.on_failure(admission, &err);
                } else {
                    self.on_ignored(admission);
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Current state. An open circuit whose timeout has elapsed still reports
    /// `Open` until the next call attempts the probe.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures counted so far.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Build the rejection error for the current state.
    pub fn open_error(&self) -> CircuitOpenError {
        let inner = self.inner.lock();
        CircuitOpenError {
            breaker: self.name.clone(),
            retry_after: self.remaining_open(&inner),
        }
    }

    /// Point-in-time view for monitoring.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
            last_failure_at: inner.last_failure_at,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Pin the circuit open. It stays open until [`reset`](Self::reset).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.forced_open = true;
        inner.probe_in_flight = false;
        tracing::warn!(breaker = %self.name, "Circuit forced open");
    }

    /// Return to the initial closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
        inner.forced_open = false;
        tracing::info!(breaker = %self.name, "Circuit manually reset");
    }

    /// Time left before an open circuit admits a probe; `None` once elapsed.
    fn remaining_open(&self, inner: &BreakerInner) -> Option<Duration> {
        if inner.forced_open {
            return Some(self.config.recovery_timeout);
        }
        let last_failure = inner.last_failure?;
        self.config
            .recovery_timeout
            .checked_sub(last_failure.elapsed())
            .filter(|left| !left.is_zero())
    }

    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                inner.rejected_calls += 1;
                Err(CircuitOpenError {
                    breaker: self.name.clone(),
                    retry_after: None,
                })
            }
            CircuitState::Open => match self.remaining_open(&inner) {
                None => {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(
                        breaker = %self.name,
                        "Circuit transitioning to half-open for recovery test"
                    );
                    Ok(Admission::Probe)
                }
                Some(retry_after) => {
                    inner.rejected_calls += 1;
                    Err(CircuitOpenError {
                        breaker: self.name.clone(),
                        retry_after: Some(retry_after),
                    })
                }
            },
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;

        match admission {
            Admission::Probe => {
                inner.probe_in_flight = false;
                // Forced open mid-probe: stay open with the failure count intact.
                if inner.state == CircuitState::HalfOpen {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    tracing::info!(breaker = %self.name, "Circuit closed after successful recovery");
                }
            }
            // A call admitted before the circuit opened does not close it.
            Admission::Normal if inner.state == CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            Admission::Normal => {}
        }
    }

    fn on_failure(&self, admission: Admission, err: &(dyn StdError + 'static)) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        if admission == Admission::Probe {
            inner.probe_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    error = %err,
                    "Circuit reopened after failed recovery attempt"
                );
            }
            return;
        }

        tracing::warn!(
            breaker = %self.name,
            failures = inner.consecutive_failures,
            threshold = self.config.failure_threshold,
            error = %err,
            "Protected call failed"
        );

        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            tracing::error!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "Circuit opened after repeated failures"
            );
        }
    }

    fn on_ignored(&self, admission: Admission) {
        if admission == Admission::Probe {
            self.inner.lock().probe_in_flight = false;
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Releases the probe slot if the probing future is dropped before it
/// completes, so a cancelled probe cannot wedge the circuit half-open.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    enum CallError {
        #[error("dependency down")]
        Down,

        #[error("bad input")]
        BadInput,
    }

    fn breaker(threshold: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(threshold, Duration::from_secs(timeout_secs)),
        )
        .counting::<CallError, _>(|e| matches!(e, CallError::Down))
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError<CallError>> {
        cb.protect(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CallError::Down)
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<u32, BreakerError<CallError>> {
        cb.protect(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CallError>(7)
        })
        .await
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = breaker(3, 60);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let cb = breaker(3, 60);
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            assert!(matches!(fail(&cb, &calls).await, Err(BreakerError::Inner(CallError::Down))));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_never_invokes_operation() {
        let cb = breaker(3, 60);
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        for _ in 0..5 {
            let result = succeed(&cb, &calls).await;
            assert!(matches!(result, Err(BreakerError::Open(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.snapshot().rejected_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_timeline() {
        let cb = breaker(3, 60);
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        match succeed(&cb, &calls).await {
            Err(BreakerError::Open(open)) => {
                assert_eq!(open.breaker, "test");
                assert_eq!(open.retry_after, Some(Duration::from_secs(50)));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(51)).await;
        assert_eq!(succeed(&cb, &calls).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breaker(2, 30);
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let _ = fail(&cb, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Timeout restarts from the failed probe.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(succeed(&cb, &calls).await, Err(BreakerError::Open(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_while_half_open() {
        let cb = Arc::new(breaker(1, 5));
        let calls = Arc::new(AtomicU32::new(0));
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.protect(|| async move {
                    let _ = wait.await;
                    Ok::<_, CallError>(())
                })
                .await
            })
        };
        for _ in 0..10 {
            if cb.state() == CircuitState::HalfOpen {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let concurrent = succeed(&cb, &calls).await;
        assert!(matches!(concurrent, Err(BreakerError::Open(_))));

        release.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 60);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;

        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.failure_count(), 0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unclassified_errors_do_not_count() {
        let cb = breaker(1, 60);

        for _ in 0..5 {
            let result = cb
                .protect(|| async { Err::<(), _>(CallError::BadInput) })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(CallError::BadInput))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_breakers_are_independent() {
        let transcription = breaker(1, 60);
        let language_model = breaker(1, 60);
        let calls = AtomicU32::new(0);

        let _ = fail(&transcription, &calls).await;

        assert_eq!(transcription.state(), CircuitState::Open);
        assert_eq!(language_model.state(), CircuitState::Closed);
        assert!(succeed(&language_model, &calls).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_open_stays_open_until_reset() {
        let cb = breaker(3, 1);
        let calls = AtomicU32::new(0);
        cb.force_open();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(matches!(succeed(&cb, &calls).await, Err(BreakerError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cb.reset();
        assert!(succeed(&cb, &calls).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_after_force_open_keeps_failures() {
        let cb = Arc::new(breaker(1, 5));
        let calls = Arc::new(AtomicU32::new(0));
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.protect(|| async move {
                    let _ = wait.await;
                    Ok::<_, CallError>(())
                })
                .await
            })
        };
        for _ in 0..10 {
            if cb.state() == CircuitState::HalfOpen {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.force_open();
        release.send(()).unwrap();
        probe.await.unwrap().unwrap();

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_counts_calls() {
        let cb = breaker(5, 60);
        let calls = AtomicU32::new(0);
        succeed(&cb, &calls).await.unwrap();
        succeed(&cb, &calls).await.unwrap();
        succeed(&cb, &calls).await.unwrap();
        let _ = fail(&cb, &calls).await;

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.successful_calls, 3);
        assert_eq!(snapshot.failed_calls, 1);
        assert!(snapshot.last_failure_at.is_some());
        assert_eq!(snapshot.success_rate(), 0.75);
    }

    #[test]
    fn test_presets() {
        assert_eq!(CircuitBreakerConfig::for_api_calls().failure_threshold, 3);
        assert_eq!(
            CircuitBreakerConfig::for_database().recovery_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(CircuitBreakerConfig::for_ai_services().failure_threshold, 2);
        assert!(CircuitBreakerConfig::new(0, Duration::ZERO).validate().is_err());
    }
}
