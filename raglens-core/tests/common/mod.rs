//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use raglens_core::brain::{CompletionRequest, MockLlmProvider, ModelClient};
use raglens_core::collaborators::{CUSTOMER_SUPPORT_SYSTEM_PROMPT, ProviderRegistry, Retriever, StaticRetriever};
use raglens_core::config::{EngineConfig, RetryConfig};
use raglens_core::engine::Engine;
use raglens_core::error::ProviderError;
use raglens_core::store::InMemoryStore;
use raglens_core::types::RetrievedDocument;
use std::sync::Arc;
use std::time::Duration;

/// Judge reply with every criterion set to `score`.
pub fn verdict(score: u8) -> String {
    serde_json::json!({
        "scores": {
            "accuracy": score,
            "completeness": score,
            "faithfulness": score,
            "tone": score,
            "relevance": score,
            "clarity": score,
        },
        "overall_score": f64::from(score),
        "explanation": "Grounded in the retrieved context.",
        "strengths": ["clear"],
        "weaknesses": [],
        "suggested_improvement": null,
    })
    .to_string()
}

/// Three attempts with millisecond backoff and no jitter.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn client(mock: Arc<MockLlmProvider>) -> ModelClient {
    ModelClient::new(mock, fast_retry(), Duration::from_secs(5))
}

pub fn is_generation(request: &CompletionRequest) -> bool {
    request.system.as_deref() == Some(CUSTOMER_SUPPORT_SYSTEM_PROMPT)
}

/// A provider that answers generation prompts with `answer` and judge prompts with `verdict(score)`.
pub fn scripted_provider(answer: &'static str, score: u8) -> MockLlmProvider {
    let judged = verdict(score);
    MockLlmProvider::with_handler(move |request| {
        if is_generation(request) {
            Ok(answer.to_string())
        } else {
            Ok(judged.clone())
        }
    })
}

/// A provider whose generation fails with `error` when the prompt contains `marker`.
pub fn failing_generation(marker: &'static str, error: ProviderError) -> MockLlmProvider {
    let judged = verdict(4);
    MockLlmProvider::with_handler(move |request| {
        if is_generation(request) {
            if request.full_text().contains(marker) {
                Err(error.clone())
            } else {
                Ok("Generated answer.".to_string())
            }
        } else {
            Ok(judged.clone())
        }
    })
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sampling.enabled = false;
    config.retry = fast_retry();
    config
}

pub fn corpus() -> Arc<dyn Retriever> {
    Arc::new(StaticRetriever::new().with_fallback(vec![
        RetrievedDocument::new("doc-1", "Refunds are issued within 5 business days.", 0.92)
            .with_metadata("category", "REFUND")
            .with_metadata("intent", "get_refund"),
        RetrievedDocument::new("doc-2", "Orders can be cancelled before shipping.", 0.81)
            .with_metadata("category", "ORDER")
            .with_metadata("intent", "cancel_order"),
    ]))
}

/// An in-memory engine where one mock provider serves every role.
pub fn engine_with(mock: Arc<MockLlmProvider>, config: EngineConfig) -> Engine {
    let registry = ProviderRegistry::single("mock", client(mock));
    Engine::with_parts(config, Arc::new(InMemoryStore::new()), Arc::new(registry), corpus())
}
