// SPDX-License-Identifier: Apache-2.0

//! LLM collaborator.
//!
//! The planner makes exactly two generate calls per question: one for intent
//! analysis, one for SQL synthesis. Responses are untrusted text; everything
//! downstream assumes the model can and will get things wrong.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::error::{EngineError, EngineResult};
use crate::observability::Sensitive;

const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TEMPERATURE: f32 = 0.1;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One completion. `context` entries become system content ahead of the
    /// user prompt.
    async fn generate(
        &self,
        user_prompt: &str,
        context: &[String],
        cancel: &CancellationToken,
    ) -> EngineResult<String>;
}

// ─── OpenAI-compatible ───────────────────────────────────────

/// Works against any endpoint speaking the `chat/completions` protocol.
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: Sensitive<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: Sensitive::new(api_key.into()),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn generate(
        &self,
        user_prompt: &str,
        context: &[String],
        cancel: &CancellationToken,
    ) -> EngineResult<String> {
        let mut messages = Vec::new();
        for system in context {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": user_prompt }));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        debug!(model = %self.model, "LLM request");

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            response = request => response
                .map_err(|e| EngineError::connection_failed(format!("LLM request failed: {}", e)))?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = extract_api_error(&body)
                .unwrap_or_else(|| format!("HTTP {}: {}", status, body));
            return Err(EngineError::connection_failed(format!(
                "LLM endpoint error: {}",
                message
            )));
        }

        let parsed: Value = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            parsed = response.json() => parsed
                .map_err(|e| EngineError::connection_failed(format!("LLM response unreadable: {}", e)))?,
        };

        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::connection_failed("LLM response carried no content")
            })
    }
}

// ─── Ollama ──────────────────────────────────────────────────

/// Local Ollama endpoint; no API key.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(
        &self,
        user_prompt: &str,
        context: &[String],
        cancel: &CancellationToken,
    ) -> EngineResult<String> {
        let mut messages = Vec::new();
        for system in context {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": user_prompt }));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });

        debug!(model = %self.model, base_url = %self.base_url, "Ollama request");

        let request = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            response = request => response.map_err(|e| {
                EngineError::connection_failed(format!(
                    "Ollama request failed: {}. Is Ollama running?",
                    e
                ))
            })?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::connection_failed(format!(
                "Ollama HTTP {}: {}",
                status, body
            )));
        }

        let parsed: Value = response.json().await.map_err(|e| {
            EngineError::connection_failed(format!("Ollama response unreadable: {}", e))
        })?;

        parsed["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::connection_failed("Ollama response carried no content"))
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Extract a user-friendly error message from an API error response body.
fn extract_api_error(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed["error"]["message"].as_str().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_extraction() {
        let body = r#"{"error":{"message":"Invalid API key","type":"invalid_request_error"}}"#;
        assert_eq!(extract_api_error(body), Some("Invalid API key".to_string()));
        assert_eq!(extract_api_error("not json"), None);
    }

    #[test]
    fn base_url_is_normalised() {
        let client = OpenAiCompatClient::new("https://api.example.com/v1/", "k", "m");
        assert_eq!(client.base_url, "https://api.example.com/v1");
    }

    #[tokio::test]
    async fn cancelled_before_send() {
        let client = OpenAiCompatClient::new("http://127.0.0.1:1", "k", "m");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.generate("hi", &[], &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
