//! Interfaces the amplifier activities call out to.
//!
//! Each collaborator has its own error type carrying a `retryable` flag. The
//! flag decides whether the failure becomes a transient or a non-retryable
//! activity error.
use async_trait::async_trait;

use crate::runtime::ActivityError;

macro_rules! collaborator_error {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub message: String,
            pub retryable: bool,
        }

        impl $name {
            pub fn transient(message: impl Into<String>) -> Self {
                Self { message: message.into(), retryable: true }
            }

            pub fn permanent(message: impl Into<String>) -> Self {
                Self { message: message.into(), retryable: false }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($what, ": {}"), self.message)
            }
        }

        impl std::error::Error for $name {}

        impl From<$name> for ActivityError {
            fn from(e: $name) -> Self {
                ActivityError::ApplicationFailure {
                    message: e.to_string(),
                    retryable: e.retryable,
                }
            }
        }
    };
}

collaborator_error!(
    /// Network or HTTP failure while fetching content.
    FetchError,
    "fetch failed"
);
collaborator_error!(SummarizationError, "summarization failed");
collaborator_error!(SelectionError, "channel selection failed");
collaborator_error!(DeliveryError, "delivery failed");

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Language-model backend used to describe a change and pick where to post it.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Summarize what changed between `previous` and `current`. An empty
    /// summary means nothing worth promoting.
    async fn summarize(&self, previous: &str, current: &str) -> Result<String, SummarizationError>;

    async fn select_channel(&self, summary: &str) -> Result<String, SelectionError> {
        Ok(keyword_channel(summary).to_string())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `summary` to `channel`. Deliveries sharing an
    /// `idempotency_key` describe the same promotion.
    async fn notify(&self, channel: &str, summary: &str, idempotency_key: &str) -> Result<(), DeliveryError>;
}

pub const CHANNEL_GITHUB: &str = "GitHub";
pub const CHANNEL_SLACK: &str = "Slack";
pub const CHANNEL_INTERNAL_PORTAL: &str = "InternalPortal";

/// Keyword routing: API changes go to GitHub, security news to Slack,
/// everything else to the internal portal.
pub fn keyword_channel(summary: &str) -> &'static str {
    let lower = summary.to_lowercase();
    if lower.contains("api") {
        CHANNEL_GITHUB
    } else if lower.contains("security") {
        CHANNEL_SLACK
    } else {
        CHANNEL_INTERNAL_PORTAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_channel() {
        assert_eq!(keyword_channel("New API endpoints"), CHANNEL_GITHUB);
        assert_eq!(keyword_channel("Security advisory"), CHANNEL_SLACK);
        // "api" wins when both appear
        assert_eq!(keyword_channel("security fix in the api"), CHANNEL_GITHUB);
        assert_eq!(keyword_channel("Team offsite photos"), CHANNEL_INTERNAL_PORTAL);
    }

    #[test]
    fn test_errors_keep_retry_classification() {
        let e: ActivityError = FetchError::permanent("HTTP 404").into();
        assert_eq!(
            e,
            ActivityError::ApplicationFailure {
                message: "fetch failed: HTTP 404".into(),
                retryable: false
            }
        );
        let e: ActivityError = DeliveryError::transient("HTTP 503").into();
        assert!(matches!(e, ActivityError::ApplicationFailure { retryable: true, .. }));
    }
}
