//! The content amplifier: a long-running workflow that polls a URL, notices
//! when its content changes, summarizes the change, picks a channel and
//! promotes the summary there.
//!
//! Collaborators are injected through [`Collaborators`] when the activity
//! registry is built, so tests and the binary choose their own backends.
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::retry::{ActivityOptions, RetryPolicy};
use crate::runtime::{ActivityRegistry, WorkflowRegistry};

mod activities;
pub mod collaborators;
pub mod fetch;
pub mod llm;
pub mod notify;
mod workflow;

pub use collaborators::{
    ContentFetcher, DeliveryError, FetchError, LanguageModel, Notifier, SelectionError, SummarizationError,
};
pub use workflow::content_amplifier;

pub const WORKFLOW_NAME: &str = "ContentAmplifier";

pub const FETCH_CONTENT: &str = "FetchContent";
pub const SUMMARIZE_CONTENT_DIFF: &str = "SummarizeContentDiff";
pub const SELECT_PROMOTION_CHANNEL: &str = "SelectPromotionChannel";
pub const PROMOTE_CONTENT: &str = "PromoteContent";

/// State carried across loop iterations and across continue-as-new.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmplifierState {
    pub last_content_hash: String,
    pub last_content: String,
}

/// Serializable form of [`ActivityOptions`], so the options travel inside
/// the workflow input and survive continue-as-new.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitySettings {
    /// Per-attempt deadline; `None` runs without one.
    pub timeout_ms: Option<u64>,
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    pub maximum_attempts: u32,
    pub non_retryable_error_types: Vec<String>,
    pub timeout_is_retryable: bool,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self::from_options(&ActivityOptions::default())
    }
}

impl ActivitySettings {
    pub fn from_options(options: &ActivityOptions) -> Self {
        let p = &options.retry_policy;
        Self {
            timeout_ms: options.timeout.map(|d| d.as_millis() as u64),
            initial_interval_ms: p.initial_interval.as_millis() as u64,
            backoff_coefficient: p.backoff_coefficient,
            maximum_interval_ms: p.maximum_interval.as_millis() as u64,
            maximum_attempts: p.maximum_attempts,
            non_retryable_error_types: p.non_retryable_error_types.clone(),
            timeout_is_retryable: p.timeout_is_retryable,
        }
    }

    pub fn to_options(&self) -> ActivityOptions {
        let mut policy = RetryPolicy::new(self.maximum_attempts)
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_backoff_coefficient(self.backoff_coefficient)
            .with_maximum_interval(Duration::from_millis(self.maximum_interval_ms))
            .with_timeout_retryable(self.timeout_is_retryable);
        for t in &self.non_retryable_error_types {
            policy = policy.with_non_retryable(t.clone());
        }
        ActivityOptions::new(self.timeout_ms.map(Duration::from_millis), policy)
    }
}

/// Workflow input. The same shape is handed to every new execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmplifierInput {
    pub url: String,
    pub poll_interval_ms: u64,
    /// Loop iterations before the execution continues as new.
    pub iterations_per_execution: u32,
    #[serde(default)]
    pub activity: ActivitySettings,
    #[serde(default)]
    pub state: AmplifierState,
}

impl AmplifierInput {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            poll_interval_ms: 10_000,
            iterations_per_execution: 50,
            activity: ActivitySettings::default(),
            state: AmplifierState::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDiffInput {
    pub prev_content: String,
    pub current_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteContentInput {
    pub summary: String,
    pub channel: String,
}

/// Stable content fingerprint: lowercase hex SHA-256.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Backends the amplifier activities call.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn ContentFetcher>,
    pub language_model: Arc<dyn LanguageModel>,
    pub notifier: Arc<dyn Notifier>,
}

pub fn workflow_registry() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register_typed(WORKFLOW_NAME, content_amplifier)
        .build()
}

pub fn activity_registry(collaborators: Collaborators) -> ActivityRegistry {
    activities::register(ActivityRegistry::builder(), collaborators).build()
}
