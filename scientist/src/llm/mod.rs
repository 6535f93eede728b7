//! LLM backend contract.
//!
//! Agents depend on [`LlmBackend`] only. Every failure mode (no credentials,
//! network error, non-2xx status, timeout, undecodable body) is an [`LlmError`]
//! and callers are expected to fall back to a deterministic default.

pub mod json;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use json::extract_json;
pub use openai::{OpenAiClient, OpenAiSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens: u64,
    pub finish_reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm backend unavailable: {0}")]
    Unavailable(String),
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm call timed out after {0}s")]
    Timeout(u64),
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        format: ResponseFormat,
    ) -> Result<ChatResponse, LlmError>;
}

pub type SharedBackend = Arc<dyn LlmBackend>;

/// Backend used in mock mode or without credentials. Every call fails with
/// [`LlmError::Unavailable`], so agents take their fallback paths.
#[derive(Debug, Default, Clone)]
pub struct OfflineBackend;

#[async_trait]
impl LlmBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _format: ResponseFormat,
    ) -> Result<ChatResponse, LlmError> {
        Err(LlmError::Unavailable("offline backend".to_string()))
    }
}

/// A JSON-mode reply. `value` is `None` when the content held no parsable
/// object; the raw response is kept for the analysis log either way.
#[derive(Debug, Clone)]
pub struct JsonReply {
    pub response: ChatResponse,
    pub value: Option<serde_json::Value>,
}

/// Request a JSON answer and extract the first object from the content.
pub async fn chat_json(
    backend: &dyn LlmBackend,
    system: &str,
    user: &str,
) -> Result<JsonReply, LlmError> {
    let messages = [ChatMessage::system(system), ChatMessage::user(user)];
    let response = backend.chat(&messages, ResponseFormat::Json).await?;
    let value = extract_json(&response.content);
    if value.is_none() {
        tracing::warn!(
            backend = backend.name(),
            model = %response.model,
            "LLM reply contained no JSON object"
        );
    }
    Ok(JsonReply { response, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedBackend;

    #[tokio::test]
    async fn test_offline_backend_is_unavailable() {
        let err = OfflineBackend
            .chat(&[ChatMessage::user("hi")], ResponseFormat::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_chat_json_keeps_raw_reply_when_unparsable() {
        let backend = ScriptedBackend::new(vec![Ok("sorry, no json today".to_string())]);
        let reply = chat_json(&backend, "sys", "user").await.unwrap();
        assert!(reply.value.is_none());
        assert_eq!(reply.response.content, "sorry, no json today");
    }

    #[tokio::test]
    async fn test_chat_json_extracts_fenced_object() {
        let backend = ScriptedBackend::new(vec![Ok(
            "Here you go:\n```json\n{\"ok\": true}\n```".to_string()
        )]);
        let reply = chat_json(&backend, "sys", "user").await.unwrap();
        assert_eq!(reply.value, Some(serde_json::json!({"ok": true})));
    }
}
