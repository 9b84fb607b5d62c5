use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::collaborators::{ContentFetcher, FetchError};

/// Fetches page bodies over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::permanent(e.to_string()))?;
        Ok(Self { client })
    }
}

/// 4xx responses will not improve on retry, except 408 and 429.
pub(crate) fn status_is_retryable(status: StatusCode) -> bool {
    !status.is_client_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::transient(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("{url}: HTTP {status}");
            return Err(if status_is_retryable(status) {
                FetchError::transient(message)
            } else {
                FetchError::permanent(message)
            });
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::transient(format!("{url}: reading body: {e}")))
    }
}
