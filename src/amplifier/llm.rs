//! Language-model backends: a deterministic-enough mock for local runs and an
//! OpenAI-compatible chat-completions client.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::collaborators::{
    CHANNEL_GITHUB, CHANNEL_INTERNAL_PORTAL, CHANNEL_SLACK, LanguageModel, SelectionError, SummarizationError,
    keyword_channel,
};
use super::fetch::status_is_retryable;

/// Returns a canned summary with a fresh UUID, so every change produces a
/// distinct promotion. Channel selection uses keyword routing.
#[derive(Debug, Default, Clone)]
pub struct MockLanguageModel;

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn summarize(&self, _previous: &str, _current: &str) -> Result<String, SummarizationError> {
        Ok(format!(
            "Mocked summary of the differences, unique per invocation - {}",
            uuid::Uuid::new_v4()
        ))
    }
}

#[derive(Debug, Clone)]
pub struct HttpLanguageModelConfig {
    /// Full chat-completions URL.
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for HttpLanguageModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            temperature: 0.5,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct HttpLanguageModel {
    client: reqwest::Client,
    config: HttpLanguageModelConfig,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: String,
}

/// Failure talking to the backend, before it is mapped to the caller's error type.
struct CallError {
    message: String,
    retryable: bool,
}

impl HttpLanguageModel {
    pub fn new(config: HttpLanguageModelConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client, config })
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, CallError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| CallError {
                message: e.to_string(),
                retryable: false,
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError {
                message: e.to_string(),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CallError {
                message: format!("HTTP {status}: {text}"),
                retryable: status_is_retryable(status),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| CallError {
            message: format!("malformed response: {e}"),
            retryable: false,
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| CallError {
                message: "missing choices".to_string(),
                retryable: false,
            })
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn summarize(&self, previous: &str, current: &str) -> Result<String, SummarizationError> {
        let prompt = format!(
            "Compare the following two versions of content and write a short, high-level summary of the \
             meaningful differences. Reply with an empty message if nothing meaningful changed.\n\n\
             --- PREVIOUS VERSION ---\n{previous}\n\n--- CURRENT VERSION ---\n{current}"
        );
        self.complete("You summarize content updates for readers.", prompt)
            .await
            .map_err(|e| SummarizationError {
                message: e.message,
                retryable: e.retryable,
            })
    }

    async fn select_channel(&self, summary: &str) -> Result<String, SelectionError> {
        let prompt = format!(
            "Pick the single best channel for this update. Answer with exactly one of: \
             {CHANNEL_GITHUB}, {CHANNEL_SLACK}, {CHANNEL_INTERNAL_PORTAL}.\n\nUpdate: {summary}"
        );
        let answer = self
            .complete("You route announcements to engagement channels.", prompt)
            .await
            .map_err(|e| SelectionError {
                message: e.message,
                retryable: e.retryable,
            })?;
        Ok(normalize_channel(&answer).unwrap_or_else(|| keyword_channel(summary)).to_string())
    }
}

/// Map a free-form model answer onto a known channel name.
fn normalize_channel(answer: &str) -> Option<&'static str> {
    let lower = answer.to_lowercase();
    [CHANNEL_GITHUB, CHANNEL_SLACK, CHANNEL_INTERNAL_PORTAL]
        .into_iter()
        .find(|c| lower.contains(&c.to_lowercase()))
}
