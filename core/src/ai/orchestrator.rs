use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::AiRuntimeSelection;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiChatMessage {
    pub role: String,
    pub content: String,
}

impl AiChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiChatInput {
    pub messages: Vec<AiChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiUsageMetrics {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiChatResponse {
    pub provider_id: String,
    pub model: String,
    pub content: String,
    pub usage: Option<AiUsageMetrics>,
    pub raw: Value,
}

/// One chat-completion call against one provider. No retries, no fallback.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        selection: &AiRuntimeSelection,
        input: &AiChatInput,
    ) -> Result<AiChatResponse>;
}

/// Talks to OpenAI-compatible `/chat/completions` endpoints.
pub struct HttpChatBackend {
    client: Client,
}

impl HttpChatBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("PharmaGenie/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn chat(
        &self,
        selection: &AiRuntimeSelection,
        input: &AiChatInput,
    ) -> Result<AiChatResponse> {
        let url = format!(
            "{}/chat/completions",
            selection.provider.base_url.trim_end_matches('/')
        );
        let payload = build_payload(&selection.model, input);

        let response = self
            .client
            .post(url)
            .bearer_auth(&selection.secret)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{} request failed", selection.provider.display_name))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(300).collect();
            return Err(anyhow!(
                "{} returned {status}: {excerpt}",
                selection.provider.display_name
            ));
        }

        let body: Value = response
            .json()
            .await
            .context("provider returned a non-JSON body")?;
        parse_completion(&selection.provider.id, &selection.model, body)
    }
}

fn build_payload(model: &str, input: &AiChatInput) -> Value {
    let mut payload = serde_json::json!({
        "model": model,
        "messages": normalise_messages(&input.messages),
        "temperature": input.temperature.unwrap_or(0.7),
    });
    if let Some(max_tokens) = input.max_tokens {
        payload["max_tokens"] = Value::from(max_tokens);
    }
    payload
}

fn parse_completion(provider_id: &str, model: &str, body: Value) -> Result<AiChatResponse> {
    let message = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("completion response carried no choices"))?;
    let content = message
        .get("content")
        .and_then(|val| val.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();
    let served_model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(model)
        .to_string();

    Ok(AiChatResponse {
        provider_id: provider_id.to_string(),
        model: served_model,
        usage: extract_usage(&body),
        content,
        raw: body,
    })
}

fn normalise_messages(messages: &[AiChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role.to_lowercase().as_str() {
                "system" => "system",
                "assistant" => "assistant",
                _ => "user",
            };
            serde_json::json!({
                "role": role,
                "content": m.content,
            })
        })
        .collect()
}

fn extract_usage(body: &Value) -> Option<AiUsageMetrics> {
    let field = |usage: &Value, key: &str| usage.get(key).and_then(|v| v.as_u64()).map(|v| v as u32);
    body.get("usage").map(|usage| AiUsageMetrics {
        prompt_tokens: field(usage, "prompt_tokens"),
        completion_tokens: field(usage, "completion_tokens"),
        total_tokens: field(usage, "total_tokens"),
    })
}
