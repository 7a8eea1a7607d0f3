//! Runtime configuration.
//!
//! Loaded from YAML; every field has a default, so an empty document is a
//! valid configuration.
//!
//! ```yaml
//! lock_timeout: 5s
//! near_limit_percent: 80
//! ledger:
//!   breaker: { failure_threshold: 5, recovery_timeout: 30s }
//!   retry:
//!     strategy: { type: exponential, initial: 100ms, multiplier: 2.0, max: 2s }
//!     max_attempts: 3
//! providers:
//!   transcription:
//!     breaker: { failure_threshold: 2, recovery_timeout: 2m }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tollgate_core::RetryPolicy;

use crate::resilience::{BreakerRegistry, CircuitBreakerConfig};

/// Errors from loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Resilience settings for one dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

impl DependencyConfig {
    pub fn new(breaker: CircuitBreakerConfig, retry: RetryPolicy) -> Self {
        Self { breaker, retry }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        self.breaker
            .validate()
            .and_then(|_| self.retry.validate())
            .map_err(|reason| ConfigError::ValidationError(format!("{name}: {reason}")))
    }
}

/// Configuration for the gatekeeper and protected adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Longest wait for an account lock
    #[serde(with = "tollgate_core::duration_serde")]
    pub lock_timeout: Duration,

    /// Consumption percentage at which authorizations are flagged
    pub near_limit_percent: f64,

    /// Breaker and retry policy for ledger calls
    pub ledger: DependencyConfig,

    /// Settings for providers without their own entry
    pub provider_defaults: DependencyConfig,

    /// Per-provider settings, keyed by breaker name
    pub providers: BTreeMap<String, DependencyConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            near_limit_percent: 80.0,
            ledger: DependencyConfig::new(
                CircuitBreakerConfig::for_database(),
                RetryPolicy::default(),
            ),
            provider_defaults: DependencyConfig::new(
                CircuitBreakerConfig::for_api_calls(),
                RetryPolicy::default(),
            ),
            providers: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = if yaml.trim().is_empty() {
            RuntimeConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "lock_timeout must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.near_limit_percent) {
            return Err(ConfigError::ValidationError(format!(
                "near_limit_percent must be between 0 and 100, got {}",
                self.near_limit_percent
            )));
        }
        self.ledger.validate("ledger")?;
        self.provider_defaults.validate("provider_defaults")?;
        for (name, provider) in &self.providers {
            provider.validate(&format!("providers.{name}"))?;
        }
        Ok(())
    }

    /// Settings for the provider named `name`.
    pub fn provider(&self, name: &str) -> &DependencyConfig {
        self.providers.get(name).unwrap_or(&self.provider_defaults)
    }

    /// Registry preconfigured with every provider's breaker settings.
    pub fn breaker_registry(&self) -> BreakerRegistry {
        self.providers.iter().fold(
            BreakerRegistry::new(self.provider_defaults.breaker.clone()),
            |registry, (name, provider)| registry.with_config(name.clone(), provider.breaker.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::RetryStrategy;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RuntimeConfig::from_yaml("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.ledger.breaker, CircuitBreakerConfig::for_database());
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
lock_timeout: 2s
near_limit_percent: 90
ledger:
  breaker:
    failure_threshold: 4
    recovery_timeout: 45s
  retry:
    strategy:
      type: linear
      initial: 50ms
      increment: 50ms
      max: 500ms
    max_attempts: 5
providers:
  transcription:
    breaker:
      failure_threshold: 2
      recovery_timeout: 2m
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.near_limit_percent, 90.0);
        assert_eq!(config.ledger.breaker.failure_threshold, 4);
        assert_eq!(config.ledger.retry.max_attempts, 5);
        assert!(matches!(
            config.ledger.retry.strategy,
            RetryStrategy::Linear { .. }
        ));
        assert_eq!(
            config.provider("transcription").breaker.recovery_timeout,
            Duration::from_secs(120)
        );
        assert_eq!(
            config.provider("task_board").breaker,
            CircuitBreakerConfig::for_api_calls()
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = RuntimeConfig::from_yaml("near_limit_percent: 150");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let result = RuntimeConfig::from_yaml("ledger:\n  breaker:\n    failure_threshold: 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(msg)) if msg.starts_with("ledger")));

        let result = RuntimeConfig::from_yaml("lock_timeout: soon");
        assert!(matches!(result, Err(ConfigError::YamlError(_))));
    }

    #[test]
    fn test_registry_uses_provider_settings() {
        let config = RuntimeConfig::from_yaml(
            "providers:\n  language_model:\n    breaker:\n      failure_threshold: 7\n",
        )
        .unwrap();

        let registry = config.breaker_registry();

        assert_eq!(registry.get_or_create("language_model").config().failure_threshold, 7);
        assert_eq!(registry.get_or_create("other").config().failure_threshold, 3);
    }
}
