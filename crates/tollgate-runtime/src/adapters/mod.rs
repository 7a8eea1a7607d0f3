//! Integration adapters for external services.
//!
//! Each external service is described by a trait; concrete clients live in
//! the application. [`Protected`] wraps any of them with the circuit breaker
//! and retry policy registered for that service, so an outage in one service
//! cannot affect calls to another.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

mod protected;

pub use protected::{AdapterError, Protected};

/// Breaker name for the speech-to-text service.
pub const TRANSCRIPTION: &str = "transcription";

/// Breaker name for the language-model service.
pub const LANGUAGE_MODEL: &str = "language_model";

/// Breaker name for the task-board service.
pub const TASK_BOARD: &str = "task_board";

/// Errors from external service clients.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Whether the error reflects the service's health rather than the
    /// request. Only these count toward opening the service's breaker.
    pub fn is_dependency_failure(&self) -> bool {
        match self {
            ProviderError::HttpError(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_) => true,
            ProviderError::ApiError { status, .. } => *status >= 500,
            ProviderError::InvalidRequest(_) | ProviderError::AuthError => false,
        }
    }
}

/// Audio to transcribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSource {
    /// Where the recording can be fetched
    pub url: String,

    /// Container or codec hint (e.g. "wav")
    #[serde(default)]
    pub format: Option<String>,
}

/// Result of a transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,

    /// Length of the recording; the basis for actual consumption
    pub duration_seconds: f64,

    /// Overall confidence between 0.0 and 1.0
    pub confidence: f64,
}

impl Transcript {
    /// Recording length in hours.
    pub fn duration_hours(&self) -> f64 {
        self.duration_seconds / 3600.0
    }
}

/// A task to create on a task board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub assignee: Option<String>,
}

/// Speech-to-text service.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    async fn transcribe(&self, audio: &AudioSource) -> Result<Transcript, ProviderError>;
}

/// Language-model completion service.
#[async_trait]
pub trait LanguageModelProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Project-management service that receives extracted tasks.
#[async_trait]
pub trait TaskBoardProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Create a task and return its identifier on the board.
    async fn create_task(&self, task: &TaskDraft) -> Result<String, ProviderError>;
}
