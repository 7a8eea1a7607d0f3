//! Breaker- and retry-protected service clients.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tollgate_core::RetryPolicy;

use super::{
    AudioSource, LanguageModelProvider, ProviderError, TaskBoardProvider, TaskDraft, Transcript,
    TranscriptionProvider,
};
use crate::config::RuntimeConfig;
use crate::resilience::{
    BreakerRegistry, CircuitBreaker, CircuitOpenError, RetryError, RetryExecutor,
    TerminalRetryFailure,
};

/// Errors from a protected call.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The service's breaker is open; the service was not called.
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),

    #[error(transparent)]
    RetriesExhausted(TerminalRetryFailure<ProviderError>),

    /// The service rejected the request itself.
    #[error(transparent)]
    Provider(ProviderError),
}

impl AdapterError {
    /// Whether the service is currently unavailable, as opposed to the
    /// request being wrong.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            AdapterError::CircuitOpen(_) | AdapterError::RetriesExhausted(_)
        )
    }
}

impl From<RetryError<ProviderError>> for AdapterError {
    fn from(err: RetryError<ProviderError>) -> Self {
        match err {
            RetryError::CircuitOpen(open) => AdapterError::CircuitOpen(open),
            RetryError::Exhausted(failure) => AdapterError::RetriesExhausted(failure),
            RetryError::Rejected(err) => AdapterError::Provider(err),
        }
    }
}

/// A service client bound to its breaker and retry policy.
pub struct Protected<P: ?Sized> {
    provider: Arc<P>,
    executor: RetryExecutor,
}

impl<P: ?Sized> Protected<P> {
    pub fn new(provider: Arc<P>, breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            executor: RetryExecutor::new(breaker, policy),
        }
    }

    /// Bind `provider` to the breaker registered as `name`, creating it if
    /// needed. Only [`ProviderError::is_dependency_failure`] errors count
    /// against that breaker.
    pub fn bind(
        provider: Arc<P>,
        name: &str,
        registry: &BreakerRegistry,
        config: &RuntimeConfig,
    ) -> Self {
        let breaker = registry.get_or_insert_with(name, |breaker_config| {
            CircuitBreaker::new(name, breaker_config)
                .counting::<ProviderError, _>(ProviderError::is_dependency_failure)
        });
        Self::new(provider, breaker, config.provider(name).retry.clone())
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.executor.breaker()
    }

    /// Run `op` against the provider under the breaker and retry policy.
    pub async fn call<'a, T, F, Fut>(&'a self, mut op: F) -> Result<T, AdapterError>
    where
        F: FnMut(&'a P) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let provider: &'a P = &self.provider;
        self.executor
            .run(|| op(provider))
            .await
            .map_err(AdapterError::from)
    }
}

impl Protected<dyn TranscriptionProvider> {
    pub async fn transcribe(&self, audio: &AudioSource) -> Result<Transcript, AdapterError> {
        self.call(|provider| provider.transcribe(audio)).await
    }
}

impl Protected<dyn LanguageModelProvider> {
    pub async fn complete(&self, prompt: &str) -> Result<String, AdapterError> {
        self.call(|provider| provider.complete(prompt)).await
    }
}

impl Protected<dyn TaskBoardProvider> {
    pub async fn create_task(&self, task: &TaskDraft) -> Result<String, AdapterError> {
        self.call(|provider| provider.create_task(task)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LANGUAGE_MODEL, TASK_BOARD, TRANSCRIPTION};
    use crate::config::DependencyConfig;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tollgate_core::RetryStrategy;

    /// Fails with `error` for the first `failures` calls.
    struct ScriptedService {
        failures: AtomicU32,
        error: ProviderError,
        calls: AtomicU32,
    }

    impl ScriptedService {
        fn new(failures: u32, error: ProviderError) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            })
        }

        fn healthy() -> Arc<Self> {
            Self::new(0, ProviderError::AuthError)
        }

        fn next(&self) -> Result<(), ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(())
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TranscriptionProvider for ScriptedService {
        fn name(&self) -> &str {
            "scripted-stt"
        }

        async fn transcribe(&self, audio: &AudioSource) -> Result<Transcript, ProviderError> {
            self.next()?;
            Ok(Transcript {
                text: format!("transcript of {}", audio.url),
                duration_seconds: 1800.0,
                confidence: 0.95,
            })
        }
    }

    #[async_trait]
    impl LanguageModelProvider for ScriptedService {
        fn name(&self) -> &str {
            "scripted-llm"
        }

        async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
            self.next()?;
            Ok(format!("summary: {prompt}"))
        }
    }

    #[async_trait]
    impl TaskBoardProvider for ScriptedService {
        fn name(&self) -> &str {
            "scripted-board"
        }

        async fn create_task(&self, task: &TaskDraft) -> Result<String, ProviderError> {
            self.next()?;
            Ok(format!("TASK-{}", task.title.len()))
        }
    }

    fn config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.provider_defaults = DependencyConfig::new(
            CircuitBreakerConfig::new(2, Duration::from_secs(120)),
            RetryPolicy::new(
                RetryStrategy::exponential(Duration::from_millis(10), 2.0, Duration::from_millis(40)),
                3,
            ),
        );
        config
    }

    fn audio() -> AudioSource {
        AudioSource {
            url: "s3://bucket/meeting.wav".into(),
            format: Some("wav".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let config = config();
        let registry = config.breaker_registry();
        let service = ScriptedService::new(1, ProviderError::Timeout(Duration::from_secs(30)));
        let stt = Protected::<dyn TranscriptionProvider>::bind(
            service.clone(),
            TRANSCRIPTION,
            &registry,
            &config,
        );

        let transcript = stt.transcribe(&audio()).await.unwrap();

        assert_eq!(transcript.duration_hours(), 0.5);
        assert_eq!(service.calls(), 2);
        assert_eq!(stt.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_isolated_to_one_service() {
        let config = config();
        let registry = config.breaker_registry();
        let failing = ScriptedService::new(100, ProviderError::HttpError("503".into()));
        let healthy = ScriptedService::healthy();

        let stt = Protected::<dyn TranscriptionProvider>::bind(
            failing.clone(),
            TRANSCRIPTION,
            &registry,
            &config,
        );
        let llm = Protected::<dyn LanguageModelProvider>::bind(
            healthy.clone(),
            LANGUAGE_MODEL,
            &registry,
            &config,
        );

        let err = stt.transcribe(&audio()).await.unwrap_err();
        assert!(matches!(err, AdapterError::CircuitOpen(_)));
        assert!(err.is_unavailable());
        assert_eq!(failing.calls(), 2);

        // Further calls are rejected without reaching the service.
        let err = stt.transcribe(&audio()).await.unwrap_err();
        assert!(matches!(err, AdapterError::CircuitOpen(_)));
        assert_eq!(failing.calls(), 2);

        assert_eq!(llm.complete("notes").await.unwrap(), "summary: notes");
        assert_eq!(
            registry.get(LANGUAGE_MODEL).unwrap().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_request_errors_do_not_trip_breaker() {
        let config = config();
        let registry = config.breaker_registry();
        let service = ScriptedService::new(
            10,
            ProviderError::ApiError {
                status: 422,
                message: "missing title".into(),
            },
        );
        let board = Protected::<dyn TaskBoardProvider>::bind(
            service.clone(),
            TASK_BOARD,
            &registry,
            &config,
        );
        let draft = TaskDraft {
            title: "Follow up".into(),
            description: None,
            assignee: None,
        };

        for _ in 0..5 {
            let err = board.create_task(&draft).await.unwrap_err();
            assert!(matches!(err, AdapterError::Provider(ProviderError::ApiError { status: 422, .. })));
            assert!(!err.is_unavailable());
        }
        assert_eq!(service.calls(), 5);
        assert_eq!(board.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_last_error() {
        let mut config = config();
        config.providers.insert(
            LANGUAGE_MODEL.to_string(),
            DependencyConfig::new(
                CircuitBreakerConfig::new(10, Duration::from_secs(60)),
                RetryPolicy::new(
                    RetryStrategy::linear(
                        Duration::from_millis(5),
                        Duration::from_millis(5),
                        Duration::from_millis(20),
                    ),
                    2,
                ),
            ),
        );
        let registry = config.breaker_registry();
        let service = ScriptedService::new(5, ProviderError::RateLimited { retry_after: None });
        let llm = Protected::<dyn LanguageModelProvider>::bind(
            service.clone(),
            LANGUAGE_MODEL,
            &registry,
            &config,
        );

        match llm.complete("notes").await {
            Err(AdapterError::RetriesExhausted(failure)) => {
                assert_eq!(failure.attempts, 2);
                assert_eq!(failure.operation, LANGUAGE_MODEL);
                assert!(matches!(failure.last_error, ProviderError::RateLimited { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(service.calls(), 2);
    }
}
