use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::collaborators::{DeliveryError, Notifier};
use super::fetch::status_is_retryable;

/// Logs the promotion and prints it to stdout.
#[derive(Debug, Default, Clone)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, channel: &str, summary: &str, idempotency_key: &str) -> Result<(), DeliveryError> {
        tracing::info!(target: "content_amplifier::notify", channel, idempotency_key, "promoting content");
        println!("Promoting to {channel}.\nThe post will include -- {summary}");
        Ok(())
    }
}

/// POSTs each promotion as JSON to a webhook.
///
/// The idempotency key is sent as an `Idempotency-Key` header so the receiver
/// can drop repeats of a promotion it already accepted.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct Promotion<'a> {
    channel: &'a str,
    summary: &'a str,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::permanent(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, channel: &str, summary: &str, idempotency_key: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", idempotency_key)
            .json(&Promotion { channel, summary })
            .send()
            .await
            .map_err(|e| DeliveryError::transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = format!("webhook returned HTTP {status}");
        Err(if status_is_retryable(status) {
            DeliveryError::transient(message)
        } else {
            DeliveryError::permanent(message)
        })
    }
}
