//! Application configuration.
//!
//! Sources, highest priority first:
//! 1. Environment variables (`AMPLIFIER_URL`, `AMPLIFIER_DB_URL`,
//!    `AMPLIFIER_LLM_BACKEND`, `AMPLIFIER_LOG_FORMAT`)
//! 2. TOML config file
//! 3. Defaults
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::amplifier::{ActivitySettings, AmplifierInput, AmplifierState};
use crate::retry::{ActivityOptions, RetryPolicy};
use crate::runtime::{LogFormat, ObservabilityConfig, RuntimeOptions};

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "reading config: {e}"),
            ConfigError::Parse(e) => write!(f, "parsing config: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub url: String,
    pub instance_id: String,
    pub poll_interval_secs: u64,
    pub iterations_per_execution: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/".to_string(),
            instance_id: "content-amplifier".to_string(),
            poll_interval_secs: 10,
            iterations_per_execution: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub timeout_secs: u64,
    pub initial_interval_secs: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_secs: u64,
    /// 0 retries forever.
    pub maximum_attempts: u32,
    pub non_retryable_error_types: Vec<String>,
    pub timeout_is_retryable: bool,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            initial_interval_secs: 1,
            backoff_coefficient: 2.0,
            maximum_interval_secs: 10,
            maximum_attempts: 3,
            non_retryable_error_types: Vec::new(),
            timeout_is_retryable: true,
        }
    }
}

impl ActivityConfig {
    pub fn to_options(&self) -> ActivityOptions {
        let mut policy = RetryPolicy::new(self.maximum_attempts)
            .with_initial_interval(Duration::from_secs(self.initial_interval_secs))
            .with_backoff_coefficient(self.backoff_coefficient)
            .with_maximum_interval(Duration::from_secs(self.maximum_interval_secs))
            .with_timeout_retryable(self.timeout_is_retryable);
        for t in &self.non_retryable_error_types {
            policy = policy.with_non_retryable(t.clone());
        }
        let timeout = (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs));
        ActivityOptions::new(timeout, policy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    #[default]
    Mock,
    Http,
}

impl std::str::FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(LlmBackend::Mock),
            "http" => Ok(LlmBackend::Http),
            other => Err(format!("unknown llm backend '{other}' (expected mock or http)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    /// Chat-completions URL for the http backend.
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Mock,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyBackend {
    #[default]
    Console,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub backend: NotifyBackend,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub orchestration_concurrency: usize,
    pub worker_concurrency: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let defaults = RuntimeOptions::default();
        Self {
            orchestration_concurrency: defaults.orchestration_concurrency,
            worker_concurrency: defaults.worker_concurrency,
            shutdown_grace_secs: defaults.shutdown_grace.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    pub activity: ActivityConfig,
    pub store: StoreConfig,
    pub llm: LlmConfig,
    pub notify: NotifyConfig,
    pub runtime: RuntimeConfig,
    pub logging: ObservabilityConfig,
}

impl AppConfig {
    /// Load from `path` (if given), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(ConfigError::Io)?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(ConfigError::Parse)
    }

    /// Apply overrides looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = var("AMPLIFIER_URL") {
            self.monitor.url = url;
        }
        if let Some(db) = var("AMPLIFIER_DB_URL") {
            self.store.database_url = db;
        }
        if let Some(backend) = var("AMPLIFIER_LLM_BACKEND") {
            self.llm.backend = backend.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(format) = var("AMPLIFIER_LOG_FORMAT") {
            self.logging.log_format = format.parse::<LogFormat>().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.url.trim().is_empty() {
            return Err(ConfigError::Invalid("monitor.url must not be empty".into()));
        }
        if self.monitor.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("monitor.instance_id must not be empty".into()));
        }
        if self.notify.backend == NotifyBackend::Webhook && self.notify.webhook_url.is_none() {
            return Err(ConfigError::Invalid("notify.webhook_url is required for the webhook backend".into()));
        }
        self.activity
            .to_options()
            .retry_policy
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("activity: {e}")))?;
        Ok(())
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            orchestration_concurrency: self.runtime.orchestration_concurrency,
            worker_concurrency: self.runtime.worker_concurrency,
            shutdown_grace: Duration::from_secs(self.runtime.shutdown_grace_secs),
            ..RuntimeOptions::default()
        }
    }

    /// Input for a fresh monitor instance.
    pub fn amplifier_input(&self) -> AmplifierInput {
        AmplifierInput {
            url: self.monitor.url.clone(),
            poll_interval_ms: self.monitor.poll_interval_secs.saturating_mul(1000),
            iterations_per_execution: self.monitor.iterations_per_execution,
            activity: ActivitySettings::from_options(&self.activity.to_options()),
            state: AmplifierState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_values() {
        let c = AppConfig::default();
        assert_eq!(c.monitor.poll_interval_secs, 10);
        assert_eq!(c.monitor.iterations_per_execution, 50);
        let options = c.activity.to_options();
        assert_eq!(options.timeout, Some(Duration::from_secs(10)));
        assert_eq!(options.retry_policy.maximum_attempts, 3);
        assert_eq!(options.retry_policy.initial_interval, Duration::from_secs(1));
        assert_eq!(options.retry_policy.maximum_interval, Duration::from_secs(10));
        assert_eq!(c.store.database_url, "sqlite::memory:");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_toml_sections_and_env_overrides() {
        let mut c = AppConfig::from_toml(
            r#"
            [monitor]
            url = "https://example.com/news"
            poll_interval_secs = 30

            [activity]
            maximum_attempts = 5

            [llm]
            backend = "http"
            model = "local-model"

            [logging]
            format = "json"
            level = "debug"
            "#,
        )
        .expect("parse");
        assert_eq!(c.monitor.url, "https://example.com/news");
        assert_eq!(c.monitor.iterations_per_execution, 50);
        assert_eq!(c.activity.maximum_attempts, 5);
        assert_eq!(c.llm.backend, LlmBackend::Http);
        assert_eq!(c.logging.log_format, LogFormat::Json);

        let env: HashMap<&str, &str> = [("AMPLIFIER_URL", "https://other.test/"), ("AMPLIFIER_LLM_BACKEND", "mock")]
            .into_iter()
            .collect();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).expect("env");
        assert_eq!(c.monitor.url, "https://other.test/");
        assert_eq!(c.llm.backend, LlmBackend::Mock);

        let input = c.amplifier_input();
        assert_eq!(input.poll_interval_ms, 30_000);
        assert_eq!(input.activity.maximum_attempts, 5);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let mut c = AppConfig::default();
        let err = c.apply_env(|k| (k == "AMPLIFIER_LOG_FORMAT").then(|| "xml".to_string()));
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let mut c = AppConfig::default();
        c.activity.backoff_coefficient = 0.5;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = AppConfig::default();
        c.notify.backend = NotifyBackend::Webhook;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_huge_poll_interval_saturates() {
        let mut c = AppConfig::default();
        c.monitor.poll_interval_secs = u64::MAX;
        assert_eq!(c.amplifier_input().poll_interval_ms, u64::MAX);
        c.monitor.poll_interval_secs = 30;
        assert_eq!(c.amplifier_input().poll_interval_ms, 30_000);
    }
}
