//! Wire-level provider access
//!
//! Both supported vendors speak a chat-completions dialect; the differences
//! live entirely in this module so the service above iterates providers
//! generically.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{ChatTransport, LlmRequest, LlmResponse};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ProviderError;

/// Shared HTTP transport for all providers.
///
/// One pooled client for the whole process; per-call deadlines are enforced
/// by the service, the client timeout is only a backstop.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .pool_max_idle_per_host(8)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(
        &self,
        provider: &ProviderConfig,
        request: &LlmRequest,
    ) -> Result<LlmResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", provider.base_url);
        let api_key = provider.api_key.as_deref().unwrap_or_default();

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&build_body(provider, request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(provider.request_timeout)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::Throttled);
        }
        if status.is_server_error() {
            let message = truncated_body(response).await;
            return Err(ProviderError::Server {
                status: status.as_u16(),
                message,
            });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::Auth);
        }
        if !status.is_success() {
            let message = truncated_body(response).await;
            return Err(ProviderError::InvalidRequest {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("empty content".to_string()));
        }

        Ok(LlmResponse {
            provider: provider.id.clone(),
            content,
            total_tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

/// Request body per vendor dialect
fn build_body(provider: &ProviderConfig, request: &LlmRequest) -> serde_json::Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": request.prompt}));

    match provider.kind {
        ProviderKind::OpenAi => json!({
            "model": provider.model,
            "messages": messages,
            "max_completion_tokens": request.max_tokens,
        }),
        ProviderKind::Xai => json!({
            "model": provider.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        }),
    }
}

/// Bound error bodies so a hostile payload cannot flood the logs
async fn truncated_body(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    text.chars().take(500).collect()
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}
