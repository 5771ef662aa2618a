//! Brain module: LLM provider abstraction.
//!
//! Defines the `LlmProvider` trait that the judge, the generator and the
//! narrator depend on, and `ModelClient`, which wraps a provider with a
//! per-call timeout, retry on transient errors, and cost accounting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::ProviderError;
use crate::providers::with_retry;
use crate::types::{CostEstimate, EvaluatorIdentity, TokenUsage};

/// Represents a participant role in a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A request for a single completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

impl CompletionRequest {
    /// A single-turn request with an optional system prompt.
    pub fn prompt(system: Option<String>, user: impl Into<String>) -> Self {
        Self {
            system,
            messages: vec![Message::user(user)],
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Concatenated text of every message, used by scripted providers.
    pub fn full_text(&self) -> String {
        let mut text = self.system.clone().unwrap_or_default();
        for message in &self.messages {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&message.content);
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Short provider name, e.g. "anthropic".
    fn provider_name(&self) -> &str;

    /// Return the model name.
    fn model_name(&self) -> &str;

    /// Return the cost per token (input, output) in USD.
    fn cost_per_token(&self) -> (f64, f64);
}

/// A provider wrapped with a per-call timeout, retry and usage tracking.
#[derive(Clone)]
pub struct ModelClient {
    provider: Arc<dyn LlmProvider>,
    retry: RetryConfig,
    timeout: Duration,
    total_usage: Arc<Mutex<TokenUsage>>,
}

impl std::fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClient")
            .field("provider", &self.provider.provider_name())
            .field("model", &self.provider.model_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ModelClient {
    pub fn new(provider: Arc<dyn LlmProvider>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            timeout,
            total_usage: Arc::new(Mutex::new(TokenUsage::default())),
        }
    }

    /// Same provider and usage counter, different per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn identity(&self) -> EvaluatorIdentity {
        EvaluatorIdentity::new(self.provider.provider_name(), self.provider.model_name())
    }

    /// Complete a request. Each attempt is bounded by the timeout; transient
    /// failures are retried with backoff before being surfaced.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let timeout = self.timeout;
        let provider = &self.provider;
        let response = with_retry(&self.retry, || {
            let request = request.clone();
            async move {
                match tokio::time::timeout(timeout, provider.complete(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }),
                }
            }
        })
        .await?;

        debug!(
            provider = self.provider.provider_name(),
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );
        self.track_usage(&response.usage);
        Ok(response)
    }

    pub fn estimate_cost(&self, usage: &TokenUsage) -> CostEstimate {
        let (input_rate, output_rate) = self.provider.cost_per_token();
        CostEstimate {
            input_cost: usage.input_tokens as f64 * input_rate,
            output_cost: usage.output_tokens as f64 * output_rate,
        }
    }

    fn track_usage(&self, usage: &TokenUsage) {
        let mut total = self.total_usage.lock().unwrap_or_else(|e| e.into_inner());
        total.accumulate(usage);
    }

    pub fn total_usage(&self) -> TokenUsage {
        *self.total_usage.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type Handler = dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync;

/// A scripted provider for tests and offline runs.
///
/// Queued results are returned first, in order. Once the queue is empty the
/// handler (if any) decides the reply, otherwise a fixed fallback text is used.
pub struct MockLlmProvider {
    provider: String,
    model: String,
    queue: Mutex<VecDeque<Result<String, ProviderError>>>,
    handler: Option<Box<Handler>>,
    fallback: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "mock-model".to_string(),
            queue: Mutex::new(VecDeque::new()),
            handler: None,
            fallback: "I'm a mock LLM. No queued responses available.".to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that always answers with the given text.
    pub fn with_response(text: &str) -> Self {
        let mut provider = Self::new();
        provider.fallback = text.to_string();
        provider
    }

    /// A provider whose reply is computed from each request.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        let mut provider = Self::new();
        provider.handler = Some(Box::new(handler));
        provider
    }

    pub fn named(mut self, provider: &str, model: &str) -> Self {
        self.provider = provider.to_string();
        self.model = model.to_string();
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a text reply for the next call.
    pub fn queue_response(&self, text: &str) {
        self.lock_queue().push_back(Ok(text.to_string()));
    }

    /// Queue an error for the next call.
    pub fn queue_error(&self, error: ProviderError) {
        self.lock_queue().push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, ProviderError>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn text_response(&self, text: String) -> CompletionResponse {
        CompletionResponse {
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: (text.len() / 4).max(1),
            },
            text,
            model: self.model.clone(),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.lock_queue().pop_front();
        let reply = match queued {
            Some(reply) => reply,
            None => match &self.handler {
                Some(handler) => handler(&request),
                None => Ok(self.fallback.clone()),
            },
        };
        reply.map(|text| self.text_response(text))
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (f64, f64) {
        (0.0, 0.0) // free for mock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_mock_queue_then_fallback() {
        let mock = MockLlmProvider::with_response("fallback");
        mock.queue_response("first");
        let req = CompletionRequest::prompt(None, "hi");
        assert_eq!(mock.complete(req.clone()).await.unwrap().text, "first");
        assert_eq!(mock.complete(req).await.unwrap().text, "fallback");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_handler_sees_request() {
        let mock = MockLlmProvider::with_handler(|req| Ok(req.full_text().to_uppercase()));
        let req = CompletionRequest::prompt(Some("sys".into()), "hello");
        assert_eq!(mock.complete(req).await.unwrap().text, "SYS\nHELLO");
        assert_eq!(mock.requests()[0].messages[0].content, "hello");
    }

    #[tokio::test]
    async fn test_client_retries_transient_then_succeeds() {
        let mock = Arc::new(MockLlmProvider::with_response("ok"));
        mock.queue_error(ProviderError::Connection {
            message: "reset".into(),
        });
        let client = ModelClient::new(mock.clone(), fast_retry(), Duration::from_secs(5));
        let response = client
            .complete(CompletionRequest::prompt(None, "q"))
            .await
            .unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(client.total_usage().input_tokens, 100);
    }

    #[tokio::test]
    async fn test_client_does_not_retry_permanent_errors() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_error(ProviderError::AuthFailed {
            provider: "mock".into(),
        });
        let client = ModelClient::new(mock.clone(), fast_retry(), Duration::from_secs(5));
        let err = client
            .complete(CompletionRequest::prompt(None, "q"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthFailed { .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_client_timeout_is_transient() {
        let mock = Arc::new(MockLlmProvider::new().with_delay(Duration::from_millis(200)));
        let client = ModelClient::new(mock.clone(), fast_retry(), Duration::from_millis(10));
        let err = client
            .complete(CompletionRequest::prompt(None, "q"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
        assert!(err.is_transient());
        assert_eq!(mock.call_count(), 3);
    }

    #[test]
    fn test_identity_and_cost() {
        let client = ModelClient::new(
            Arc::new(MockLlmProvider::new().named("openai", "gpt-4o")),
            RetryConfig::default(),
            Duration::from_secs(1),
        );
        assert_eq!(client.identity().to_string(), "openai/gpt-4o");
        let cost = client.estimate_cost(&TokenUsage {
            input_tokens: 10,
            output_tokens: 10,
        });
        assert_eq!(cost.total(), 0.0);
    }
}
