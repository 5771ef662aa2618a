//! OpenAI-compatible chat completions provider.
//!
//! Works with OpenAI itself and with any server that speaks the
//! `/chat/completions` protocol (Azure, Ollama, vLLM, LM Studio).

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: usize,
    timeout_secs: u64,
    cost_input: f64,
    cost_output: f64,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = resolve_api_key("openai", config)?;
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
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for m in &request.messages {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({ "role": role, "content": m.content }));
        }

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "stream": false,
        })
    }

    fn parse_response(body: &Value, model: &str) -> Result<CompletionResponse, ProviderError> {
        let message = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| ProviderError::ResponseParse {
                message: "No choices in response".to_string(),
            })?;

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();

        let usage = TokenUsage {
            input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as usize,
            output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as usize,
        };

        Ok(CompletionResponse {
            text,
            usage,
            model: body["model"].as_str().unwrap_or(model).to_string(),
        })
    }

    /// OpenAI reports rate limits as "... Please try again in 20s." in the message.
    fn retry_after_from_message(body: &str) -> Option<u64> {
        let value: Value = serde_json::from_str(body).ok()?;
        let message = value.get("error")?.get("message")?.as_str()?;
        let tail = message.rsplit("in ").next()?;
        let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request_body(&request);

        debug!(url = %url, model = %self.model, "Sending OpenAI completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error("OpenAI", e, self.timeout_secs))?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| ProviderError::ResponseParse {
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            let retry_after = Self::retry_after_from_message(&response_body).unwrap_or(5);
            return Err(map_http_error("OpenAI", status, &response_body, retry_after));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| ProviderError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;

        Self::parse_response(&json, &self.model)
    }

    fn provider_name(&self) -> &str {
        "openai"
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

    fn provider() -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new_with_key(&ProviderConfig::openai(), "sk-test".into()).unwrap()
    }

    #[test]
    fn test_system_prompt_becomes_first_message() {
        let request = CompletionRequest::prompt(Some("judge".into()), "answer").with_temperature(0.0);
        let body = provider().build_request_body(&request);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "judge");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_parse_response() {
        let body = json!({
            "model": "gpt-4o-2024",
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 2}
        });
        let response = OpenAiCompatibleProvider::parse_response(&body, "gpt-4o").unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(response.model, "gpt-4o-2024");
        assert_eq!(response.usage.input_tokens, 7);
    }

    #[test]
    fn test_parse_response_without_choices() {
        let err = OpenAiCompatibleProvider::parse_response(&json!({"choices": []}), "m").unwrap_err();
        assert!(matches!(err, ProviderError::ResponseParse { .. }));
    }

    #[test]
    fn test_retry_after_from_message() {
        let body = r#"{"error": {"message": "Rate limit reached. Please try again in 20s."}}"#;
        assert_eq!(OpenAiCompatibleProvider::retry_after_from_message(body), Some(20));
        assert_eq!(OpenAiCompatibleProvider::retry_after_from_message("not json"), None);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let mut config = ProviderConfig::openai();
        config.base_url = Some("http://localhost:11434/v1/".into());
        let provider = OpenAiCompatibleProvider::new_with_key(&config, "k".into()).unwrap();
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
    }
}
