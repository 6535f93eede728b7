use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{ChatMessage, ChatResponse, LlmBackend, LlmError, ResponseFormat};

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiClient {
    http: reqwest::Client,
    settings: OpenAiSettings,
}

impl OpenAiClient {
    pub fn new(settings: OpenAiSettings) -> Result<Self, LlmError> {
        if settings.api_key.trim().is_empty() {
            return Err(LlmError::Unavailable("no API key configured".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        Ok(Self { http, settings })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }
}

/// Models that accept `response_format: {"type": "json_object"}`.
pub(crate) fn supports_json_mode(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.starts_with("gpt-4") || model.starts_with("gpt-3.5-turbo-1106")
}

pub(crate) fn build_request_body(
    settings: &OpenAiSettings,
    messages: &[ChatMessage],
    format: ResponseFormat,
) -> Value {
    let mut body = serde_json::json!({
        "model": settings.model,
        "messages": messages,
        "temperature": settings.temperature,
        "max_tokens": settings.max_tokens,
    });
    if format == ResponseFormat::Json && supports_json_mode(&settings.model) {
        body["response_format"] = serde_json::json!({"type": "json_object"});
    }
    body
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    total_tokens: u64,
}

pub(crate) fn parse_completion(payload: Value, fallback_model: &str) -> Result<ChatResponse, LlmError> {
    let body: CompletionBody =
        serde_json::from_value(payload).map_err(|e| LlmError::Decode(e.to_string()))?;
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))?;
    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        model: body.model.unwrap_or_else(|| fallback_model.to_string()),
        tokens: body.usage.map(|u| u.total_tokens).unwrap_or(0),
        finish_reason: choice.finish_reason,
    })
}

#[async_trait]
impl LlmBackend for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        format: ResponseFormat,
    ) -> Result<ChatResponse, LlmError> {
        let body = build_request_body(&self.settings, messages, format);
        let started = tokio::time::Instant::now();

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.settings.timeout.as_secs())
                } else {
                    LlmError::Request(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let payload: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.settings.timeout.as_secs())
            } else {
                LlmError::Decode(e.to_string())
            }
        })?;
        let reply = parse_completion(payload, &self.settings.model)?;

        tracing::debug!(
            model = %reply.model,
            tokens = reply.tokens,
            finish_reason = ?reply.finish_reason,
            latency_ms = started.elapsed().as_millis() as u64,
            "LLM call completed"
        );
        Ok(reply)
    }
}
