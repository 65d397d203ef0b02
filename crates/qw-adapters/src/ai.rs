//! Chat-completions AI provider
//!
//! Speaks the OpenAI-compatible `/v1/chat/completions` shape over reqwest.
//! Rate limits surface with their `Retry-After`, 5xx as upstream errors;
//! the engine's resilience envelope decides what to do with them.

use std::time::Duration;

use qw_ports::{AiProvider, AiProviderError, Completion, CompletionRequest, FinishReason};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Provider connection settings
#[derive(Debug, Clone)]
pub struct AiProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl AiProviderConfig {
    /// Read settings from the environment.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("QAWAVE_AI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            api_key: std::env::var("QAWAVE_AI_API_KEY").unwrap_or_default(),
            model: std::env::var("QAWAVE_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            request_timeout: Duration::from_secs(
                std::env::var("QAWAVE_AI_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }
}

/// HTTP-backed AI provider
pub struct HttpAiProvider {
    client: Client,
    config: AiProviderConfig,
}

impl HttpAiProvider {
    pub fn new(config: AiProviderConfig) -> Self {
        Self {
            client: Client::builder()
                .user_agent("qawave-runner")
                .build()
                .unwrap_or_default(),
            config,
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn classify(error: reqwest::Error) -> AiProviderError {
    if error.is_timeout() {
        AiProviderError::Timeout
    } else {
        AiProviderError::Network {
            message: error.to_string(),
        }
    }
}

impl AiProvider for HttpAiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AiProviderError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.prompt},
            ],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AiProviderError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiProviderError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| AiProviderError::InvalidResponse {
                    message: e.to_string(),
                })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AiProviderError::InvalidResponse {
                message: "response has no choices".to_string(),
            })?;
        let text = choice
            .message
            .content
            .ok_or_else(|| AiProviderError::InvalidResponse {
                message: "choice has no content".to_string(),
            })?;

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("stop") | None => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Other(other.to_string()),
        };
        let usage = parsed.usage.unwrap_or_default();

        debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "completion received"
        );
        Ok(Completion {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            finish_reason,
        })
    }
}
