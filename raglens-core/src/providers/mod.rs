//! LLM provider implementations.
//!
//! Provides concrete implementations of the `LlmProvider` trait for:
//! - Anthropic Messages API (Claude models)
//! - OpenAI-compatible APIs (OpenAI, Azure, Ollama, vLLM)
//!
//! Use `create_provider()` to instantiate a provider by name.

pub mod anthropic;
pub mod openai_compat;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::brain::{LlmProvider, ModelClient};
use crate::config::{ProviderConfig, RetryConfig};
use crate::error::ProviderError;

pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAiCompatibleProvider;

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on rate limits (respecting `retry_after_secs`), timeouts, connection
/// failures and server errors. Permanent errors (auth, parse, bad request)
/// return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &ProviderError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let ProviderError::RateLimited { retry_after_secs } = err {
        return (retry_after_secs * 1000).max(computed);
    }
    computed
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // Add up to 25% jitter
        let jitter = (capped as f64 * 0.25 * rand::random::<f64>()) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// Read the API key for a provider from its configured environment variable.
pub fn resolve_api_key(name: &str, config: &ProviderConfig) -> Result<String, ProviderError> {
    std::env::var(&config.api_key_env).map_err(|_| ProviderError::AuthFailed {
        provider: format!("{name} (env var '{}' not set)", config.api_key_env),
    })
}

/// Create a provider by name ("anthropic" or "openai").
pub fn create_provider(name: &str, config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    match name {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiCompatibleProvider::new(config)?)),
        other => Err(ProviderError::UnsupportedProvider {
            name: other.to_string(),
        }),
    }
}

/// Create a provider and wrap it with the retry policy and its own timeout.
pub fn create_client(
    name: &str,
    config: &ProviderConfig,
    retry: &RetryConfig,
) -> Result<ModelClient, ProviderError> {
    let provider = create_provider(name, config)?;
    Ok(ModelClient::new(
        provider,
        retry.clone(),
        Duration::from_secs(config.timeout_secs),
    ))
}

/// Map a reqwest transport error to a provider error.
pub(crate) fn map_transport_error(provider: &str, err: reqwest::Error, timeout_secs: u64) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { timeout_secs }
    } else if err.is_connect() || err.is_request() {
        ProviderError::Connection {
            message: format!("Request to {provider} failed: {err}"),
        }
    } else {
        ProviderError::ApiRequest {
            message: format!("Request to {provider} failed: {err}"),
        }
    }
}

/// Map a non-success HTTP status to a provider error.
pub(crate) fn map_http_error(
    provider: &str,
    status: reqwest::StatusCode,
    body_text: &str,
    default_retry_after: u64,
) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::AuthFailed {
            provider: provider.to_string(),
        },
        429 => {
            let retry_after = serde_json::from_str::<serde_json::Value>(body_text)
                .ok()
                .and_then(|v| v["error"]["retry_after_secs"].as_u64())
                .unwrap_or(default_retry_after);
            ProviderError::RateLimited {
                retry_after_secs: retry_after,
            }
        }
        code if code >= 500 => ProviderError::ServerError {
            status: code,
            message: body_text.chars().take(500).collect(),
        },
        _ => ProviderError::ApiRequest {
            message: format!("HTTP {status} from {provider}: {body_text}"),
        },
    }
}
