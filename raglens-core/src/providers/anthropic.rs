//! Anthropic Messages API provider implementation.
//!
//! Key differences from OpenAI-compatible APIs:
//! - Auth via `x-api-key` header (not `Authorization: Bearer`)
//! - Required `anthropic-version` header
//! - System prompt is a top-level `system` field, not in the messages array

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{map_http_error, map_transport_error, resolve_api_key};
use crate::brain::{CompletionRequest, CompletionResponse, LlmProvider, Role};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::types::TokenUsage;

/// The default Anthropic API base URL.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// The required Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: usize,
    timeout_secs: u64,
    cost_input: f64,
    cost_output: f64,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider, reading the key from `config.api_key_env`.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = resolve_api_key("anthropic", config)?;
        Self::new_with_key(config, api_key)
    }

    pub fn new_with_key(config: &ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Connection {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
            cost_input: config.input_cost_per_million / 1_000_000.0,
            cost_output: config.output_cost_per_million / 1_000_000.0,
        })
    }

    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(system) = &request.system {
            body["system"] = Value::String(system.clone());
        }
        body
    }

    fn parse_response(body: &Value) -> Result<CompletionResponse, ProviderError> {
        let model = body["model"].as_str().unwrap_or("unknown").to_string();
        let usage = TokenUsage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as usize,
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as usize,
        };

        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| ProviderError::ResponseParse {
                message: "Missing 'content' array in response".to_string(),
            })?;

        let text = blocks
            .iter()
            .filter(|b| b["type"].as_str().unwrap_or("text") == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse { text, usage, model })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let body = self.build_request_body(&request);
        let url = format!("{}/messages", self.base_url);

        debug!(
            model = self.model.as_str(),
            url = url.as_str(),
            "Sending Anthropic completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error("Anthropic", e, self.timeout_secs))?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| ProviderError::ResponseParse {
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(map_http_error("Anthropic", status, &body_text, 30));
        }

        let response_json: Value =
            serde_json::from_str(&body_text).map_err(|e| ProviderError::ResponseParse {
                message: format!("Invalid JSON in response: {e}"),
            })?;

        Self::parse_response(&response_json)
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (f64, f64) {
        (self.cost_input, self.cost_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new_with_key(&ProviderConfig::anthropic(), "test-key".into()).unwrap()
    }

    #[test]
    fn test_request_body_puts_system_at_top_level() {
        let request = CompletionRequest::prompt(Some("be strict".into()), "score this")
            .with_temperature(0.0)
            .with_max_tokens(123);
        let body = provider().build_request_body(&request);
        assert_eq!(body["system"], "be strict");
        assert_eq!(body["max_tokens"], 123);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "score this");
    }

    #[test]
    fn test_request_body_without_system() {
        let body = provider().build_request_body(&CompletionRequest::prompt(None, "q"));
        assert!(body.get("system").is_none());
        assert_eq!(body["max_tokens"], 2000);
    }

    #[test]
    fn test_parse_response_joins_text_blocks() {
        let body = json!({
            "model": "claude-sonnet",
            "content": [
                {"type": "text", "text": "{\"a\":"},
                {"type": "text", "text": "1}"}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 3}
        });
        let response = AnthropicProvider::parse_response(&body).unwrap();
        assert_eq!(response.text, "{\"a\":1}");
        assert_eq!(response.usage.total(), 15);
        assert_eq!(response.model, "claude-sonnet");
    }

    #[test]
    fn test_parse_response_missing_content() {
        let err = AnthropicProvider::parse_response(&json!({"model": "x"})).unwrap_err();
        assert!(matches!(err, ProviderError::ResponseParse { .. }));
    }

    #[test]
    fn test_cost_per_token() {
        let (input, output) = provider().cost_per_token();
        assert!((input - 3.0 / 1_000_000.0).abs() < 1e-15);
        assert!((output - 15.0 / 1_000_000.0).abs() < 1e-15);
    }
}
