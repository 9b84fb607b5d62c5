//! Structured logging setup and runtime counters.
//!
//! All components log through `tracing` with correlation fields
//! (`instance_id`, `execution_id`, `activity_name`, `worker_id`) under
//! targets rooted at `content_amplifier`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line, for log aggregators
    Json,
    /// Multi-line human-readable output with all fields
    Pretty,
    #[default]
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format '{other}' (expected json, pretty or compact)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    #[serde(rename = "format")]
    pub log_format: LogFormat,
    /// Level for this crate's targets (e.g. "info", "debug").
    #[serde(rename = "level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,content_amplifier={level}")
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Returns an error if a subscriber is already installed; callers that may
/// initialize more than once (tests) can ignore it.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of runtime counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub workflow_completions: u64,
    pub workflow_failures: u64,
    pub workflow_continued_as_new: u64,
    pub workflow_cancellations: u64,
    pub nondeterminism_failures: u64,
    pub activity_success: u64,
    pub activity_app_errors: u64,
    pub activity_timeouts: u64,
    pub activity_config_errors: u64,
    pub store_retries: u64,
}

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    workflow_completions: AtomicU64,
    workflow_failures: AtomicU64,
    workflow_continued_as_new: AtomicU64,
    workflow_cancellations: AtomicU64,
    nondeterminism_failures: AtomicU64,
    activity_success: AtomicU64,
    activity_app_errors: AtomicU64,
    activity_timeouts: AtomicU64,
    activity_config_errors: AtomicU64,
    store_retries: AtomicU64,
}

impl RuntimeMetrics {
    pub fn record_workflow_completion(&self) {
        self.workflow_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_workflow_failure(&self, details: &crate::ErrorDetails) {
        self.workflow_failures.fetch_add(1, Ordering::Relaxed);
        if details.is_nondeterminism() {
            self.nondeterminism_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_continue_as_new(&self) {
        self.workflow_continued_as_new.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.workflow_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity_outcome(&self, outcome: &Result<String, crate::ErrorDetails>) {
        let counter = match outcome {
            Ok(_) => &self.activity_success,
            Err(d) if d.is_timeout() => &self.activity_timeouts,
            Err(crate::ErrorDetails::Configuration { .. }) => &self.activity_config_errors,
            Err(_) => &self.activity_app_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_retry(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            workflow_completions: self.workflow_completions.load(Ordering::Relaxed),
            workflow_failures: self.workflow_failures.load(Ordering::Relaxed),
            workflow_continued_as_new: self.workflow_continued_as_new.load(Ordering::Relaxed),
            workflow_cancellations: self.workflow_cancellations.load(Ordering::Relaxed),
            nondeterminism_failures: self.nondeterminism_failures.load(Ordering::Relaxed),
            activity_success: self.activity_success.load(Ordering::Relaxed),
            activity_app_errors: self.activity_app_errors.load(Ordering::Relaxed),
            activity_timeouts: self.activity_timeouts.load(Ordering::Relaxed),
            activity_config_errors: self.activity_config_errors.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
        }
    }
}
