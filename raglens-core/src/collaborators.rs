//! External collaborators the engine depends on: retrieval, answer
//! generation, and free-text narration for diagnosis reports.
//!
//! Each is a narrow async trait so that batch runs can be driven by real
//! services, by an LLM, or by fixed fixtures in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::brain::{CompletionRequest, ModelClient};
use crate::config::EngineConfig;
use crate::diagnosis::DiagnosisSummary;
use crate::error::{ProviderError, RaglensError};
use crate::providers::{create_client, map_http_error, map_transport_error};
use crate::types::{CostEstimate, RetrievedDocument, TokenUsage};

/// Optional metadata filter applied by the retriever.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `top_k` documents, most relevant first.
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: &RetrievalFilter,
    ) -> Result<Vec<RetrievedDocument>, ProviderError>;
}

/// Calls a retrieval service over HTTP.
///
/// Request: `POST {endpoint}` with `{query, top_k, category?, intent?}`.
/// Response: either a JSON array of documents or `{"documents": [...]}`.
pub struct HttpRetriever {
    client: reqwest::Client,
    endpoint: String,
    timeout_secs: u64,
}

impl HttpRetriever {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::Connection {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout_secs,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RetrievalResponse {
    Bare(Vec<RetrievedDocument>),
    Wrapped { documents: Vec<RetrievedDocument> },
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: &RetrievalFilter,
    ) -> Result<Vec<RetrievedDocument>, ProviderError> {
        let body = serde_json::json!({
            "query": query,
            "top_k": top_k,
            "category": filter.category,
            "intent": filter.intent,
        });
        debug!(endpoint = %self.endpoint, top_k, "Sending retrieval request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error("retriever", e, self.timeout_secs))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| ProviderError::ResponseParse {
            message: format!("Failed to read retrieval response: {e}"),
        })?;
        if !status.is_success() {
            return Err(map_http_error("retriever", status, &text, 5));
        }

        let parsed: RetrievalResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::ResponseParse {
                message: format!("Invalid retrieval response: {e}"),
            })?;
        let mut documents = match parsed {
            RetrievalResponse::Bare(docs) => docs,
            RetrievalResponse::Wrapped { documents } => documents,
        };
        documents.truncate(top_k);
        Ok(documents)
    }
}

/// A fixed corpus keyed by exact query text, with an optional fallback list.
#[derive(Debug, Clone, Default)]
pub struct StaticRetriever {
    by_query: HashMap<String, Vec<RetrievedDocument>>,
    fallback: Vec<RetrievedDocument>,
}

impl StaticRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(mut self, query: impl Into<String>, documents: Vec<RetrievedDocument>) -> Self {
        self.by_query.insert(query.into(), documents);
        self
    }

    pub fn with_fallback(mut self, documents: Vec<RetrievedDocument>) -> Self {
        self.fallback = documents;
        self
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: &RetrievalFilter,
    ) -> Result<Vec<RetrievedDocument>, ProviderError> {
        let documents = self.by_query.get(query).unwrap_or(&self.fallback);
        Ok(documents
            .iter()
            .filter(|d| match &filter.category {
                Some(category) => d.category() == Some(category.as_str()),
                None => true,
            })
            .filter(|d| match &filter.intent {
                Some(intent) => d.intent() == Some(intent.as_str()),
                None => true,
            })
            .take(top_k)
            .cloned()
            .collect())
    }
}

/// Output of the generation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub answer: String,
    pub token_usage: TokenUsage,
    pub cost_estimate: CostEstimate,
    pub latency_ms: u64,
    pub provider: String,
    pub model: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Answer `query` from `contexts` using the named provider, or the default one.
    async fn generate(
        &self,
        query: &str,
        contexts: &[RetrievedDocument],
        provider: Option<&str>,
    ) -> Result<Generation, RaglensError>;
}

pub const CUSTOMER_SUPPORT_SYSTEM_PROMPT: &str = "You are a helpful customer support assistant. Your role is to provide accurate, friendly, and concise answers to customer questions.

Use the provided context from our knowledge base to answer the question. The context includes metadata about the category and intent to help you understand the context better.

Guidelines:
- Be professional and friendly
- Keep answers concise but complete
- Use information from the provided context
- If the context doesn't contain relevant information, politely say you don't have that information and suggest contacting support
- Provide step-by-step instructions when appropriate
- Adapt your tone based on the customer's question style (formal, casual, etc.)
- Do not use markdown formatting such as **bold**, *italic*, or bullet points. Write in plain text only.";

/// Human-readable meaning of single-letter query style flags.
fn flag_explanation(flag: char) -> Option<&'static str> {
    Some(match flag {
        'M' => "Morphological variation (inflections)",
        'L' => "Semantic variation (synonyms, paraphrasing)",
        'B' => "Basic syntactic structure",
        'I' => "Interrogative structure (question form)",
        'C' => "Coordinated structure (multiple clauses)",
        'N' => "Negation present",
        'P' => "Polite/formal tone",
        'Q' => "Colloquial/informal language",
        'W' => "Offensive or frustrated language",
        'K' => "Keyword mode (telegraphic)",
        'E' => "Abbreviations used",
        'Z' => "Contains errors or typos",
        _ => return None,
    })
}

fn describe_flags(flags: &[&str]) -> String {
    let descriptions: Vec<&str> = flags
        .iter()
        .flat_map(|f| f.chars())
        .filter_map(flag_explanation)
        .collect();
    if descriptions.is_empty() {
        "Standard query".to_string()
    } else {
        format!("Query style: {}", descriptions.join(", "))
    }
}

/// Grounded answer prompt with per-context metadata.
pub fn build_rag_prompt(query: &str, contexts: &[RetrievedDocument]) -> String {
    let separator = "=".repeat(60);
    let blocks = contexts
        .iter()
        .enumerate()
        .map(|(i, ctx)| {
            format!(
                "[Context {}]\nCategory: {}\nIntent: {}\n{}\nRelevance Score: {:.2}\n\n{}",
                i + 1,
                ctx.category().unwrap_or("N/A"),
                ctx.intent().unwrap_or("N/A"),
                describe_flags(&ctx.flags()),
                ctx.relevance_score,
                ctx.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Context from knowledge base:\n\n{separator}\n\n{blocks}\n\n{separator}\n\n\
Customer Question: {query}\n\n\
Please provide a helpful answer based on the context above. Consider the category and intent \
of the retrieved contexts to ensure your response is relevant and appropriate."
    )
}

/// Named model clients with role defaults.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, ModelClient>,
    default_generation: String,
    default_judge: String,
}

impl ProviderRegistry {
    /// Build clients for every configured provider whose API key is available.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut clients = HashMap::new();
        for name in ["anthropic", "openai"] {
            let Some(provider_config) = config.providers.get(name) else {
                continue;
            };
            match create_client(name, provider_config, &config.retry) {
                Ok(client) => {
                    clients.insert(name.to_string(), client);
                }
                Err(e) => warn!(provider = name, error = %e, "Provider unavailable"),
            }
        }
        Self {
            clients,
            default_generation: config.providers.default_generation.clone(),
            default_judge: config.providers.default_judge.clone(),
        }
    }

    /// A registry where one client serves every role under the given name.
    pub fn single(name: impl Into<String>, client: ModelClient) -> Self {
        let name = name.into();
        let mut clients = HashMap::new();
        clients.insert(name.clone(), client);
        Self {
            clients,
            default_generation: name.clone(),
            default_judge: name,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, client: ModelClient) {
        self.clients.insert(name.into(), client);
    }

    pub fn default_generation(&self) -> &str {
        &self.default_generation
    }

    pub fn default_judge(&self) -> &str {
        &self.default_judge
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up a client by name, falling back to `default` when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>, default: &str) -> Result<&ModelClient, ProviderError> {
        let name = name.unwrap_or(default);
        self.clients
            .get(name)
            .ok_or_else(|| ProviderError::UnsupportedProvider {
                name: name.to_string(),
            })
    }
}

/// Generates answers with an LLM using the customer-support RAG prompt.
pub struct LlmGenerator {
    registry: Arc<ProviderRegistry>,
    temperature: f32,
}

impl LlmGenerator {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            temperature: 0.7,
        }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(
        &self,
        query: &str,
        contexts: &[RetrievedDocument],
        provider: Option<&str>,
    ) -> Result<Generation, RaglensError> {
        let client = self
            .registry
            .resolve(provider, self.registry.default_generation())?;
        let request = CompletionRequest::prompt(
            Some(CUSTOMER_SUPPORT_SYSTEM_PROMPT.to_string()),
            build_rag_prompt(query, contexts),
        )
        .with_temperature(self.temperature);

        let started = Instant::now();
        let response = client.complete(request).await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        let identity = client.identity();

        Ok(Generation {
            answer: response.text.trim().to_string(),
            cost_estimate: client.estimate_cost(&response.usage),
            token_usage: response.usage,
            latency_ms,
            provider: identity.provider,
            model: identity.model,
        })
    }
}

/// Free-text elaboration for diagnosis reports.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, summary: &DiagnosisSummary) -> Result<String, ProviderError>;
}

pub struct LlmNarrator {
    client: ModelClient,
}

impl LlmNarrator {
    pub fn new(client: ModelClient) -> Self {
        Self { client }
    }

    fn build_prompt(summary: &DiagnosisSummary) -> String {
        let breakdown = |groups: &[crate::diagnosis::GroupStats]| {
            if groups.is_empty() {
                return "  No data".to_string();
            }
            groups
                .iter()
                .take(10)
                .map(|g| format!("  {}: avg={:.2}, count={}, low={}", g.name, g.avg_score, g.count, g.low_count))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let alerts = if summary.alerts.is_empty() {
            "  None".to_string()
        } else {
            summary
                .alerts
                .iter()
                .map(|a| format!("  [{}] {}", a.severity, a.message))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let low = if summary.lowest_scoring.is_empty() {
            "  None".to_string()
        } else {
            summary
                .lowest_scoring
                .iter()
                .take(5)
                .map(|q| {
                    format!(
                        "  - \"{}\" (score: {:.2}, {}/{})",
                        q.query.chars().take(50).collect::<String>(),
                        q.overall_score,
                        q.category.as_deref().unwrap_or("unknown"),
                        q.intent.as_deref().unwrap_or("unknown"),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "You are a RAG system diagnostician. Write a short assessment (3-5 sentences, plain text) \
of this chatbot's answer quality for operators.\n\n\
EVALUATION SUMMARY:\n- Total evaluations: {}\n- Average score: {:.2} (0-1 scale)\n- Period: last {} days\n\n\
SCORE BREAKDOWN BY CATEGORY:\n{}\n\nSCORE BREAKDOWN BY INTENT:\n{}\n\n\
LOW-SCORING QUERIES:\n{}\n\nACTIVE ALERTS:\n{}\n",
            summary.total_evaluations,
            summary.avg_score.unwrap_or(0.0),
            summary.period_days,
            breakdown(&summary.by_category),
            breakdown(&summary.by_intent),
            low,
            alerts,
        )
    }
}

#[async_trait]
impl Narrator for LlmNarrator {
    async fn narrate(&self, summary: &DiagnosisSummary) -> Result<String, ProviderError> {
        let request = CompletionRequest::prompt(None, Self::build_prompt(summary))
            .with_temperature(0.0)
            .with_max_tokens(1000);
        let response = self.client.complete(request).await?;
        Ok(response.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::config::RetryConfig;

    fn doc(id: &str, category: &str) -> RetrievedDocument {
        RetrievedDocument::new(id, format!("text {id}"), 0.5).with_metadata("category", category)
    }

    #[tokio::test]
    async fn test_static_retriever_filters_and_truncates() {
        let retriever = StaticRetriever::new()
            .with_documents("q", vec![doc("a", "x"), doc("b", "y"), doc("c", "x")])
            .with_fallback(vec![doc("z", "x")]);

        let all = retriever.retrieve("q", 2, &RetrievalFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        let filter = RetrievalFilter {
            category: Some("x".into()),
            intent: None,
        };
        let filtered = retriever.retrieve("q", 5, &filter).await.unwrap();
        assert_eq!(filtered.len(), 2);

        let fallback = retriever.retrieve("other", 5, &RetrievalFilter::default()).await.unwrap();
        assert_eq!(fallback[0].id, "z");
    }

    #[test]
    fn test_describe_flags() {
        assert_eq!(describe_flags(&[]), "Standard query");
        assert_eq!(
            describe_flags(&["BQ"]),
            "Query style: Basic syntactic structure, Colloquial/informal language"
        );
        assert_eq!(describe_flags(&["x"]), "Standard query");
    }

    #[test]
    fn test_rag_prompt_contains_context_metadata() {
        let prompt = build_rag_prompt("How do I cancel?", &[doc("a", "ORDER")]);
        assert!(prompt.contains("[Context 1]\nCategory: ORDER\nIntent: N/A"));
        assert!(prompt.contains("Relevance Score: 0.50"));
        assert!(prompt.contains("Customer Question: How do I cancel?"));
    }

    #[tokio::test]
    async fn test_llm_generator_uses_selected_provider() {
        let retry = RetryConfig::default();
        let timeout = Duration::from_secs(5);
        let openai = Arc::new(MockLlmProvider::with_response(" from openai ").named("openai", "gpt"));
        let anthropic = Arc::new(MockLlmProvider::with_response("from anthropic").named("anthropic", "claude"));
        let mut registry = ProviderRegistry::single("openai", ModelClient::new(openai, retry.clone(), timeout));
        registry.insert("anthropic", ModelClient::new(anthropic.clone(), retry, timeout));

        let generator = LlmGenerator::new(Arc::new(registry));
        let default = generator.generate("q", &[], None).await.unwrap();
        assert_eq!(default.answer, "from openai");
        assert_eq!(default.provider, "openai");

        let chosen = generator.generate("q", &[], Some("anthropic")).await.unwrap();
        assert_eq!(chosen.model, "claude");
        assert_eq!(
            anthropic.requests()[0].system.as_deref(),
            Some(CUSTOMER_SUPPORT_SYSTEM_PROMPT)
        );

        let err = generator.generate("q", &[], Some("cohere")).await.unwrap_err();
        assert_eq!(err.kind(), "provider_error");
    }

    #[test]
    fn test_registry_names_sorted() {
        let client = ModelClient::new(
            Arc::new(MockLlmProvider::new()),
            RetryConfig::default(),
            Duration::from_secs(1),
        );
        let mut registry = ProviderRegistry::single("openai", client.clone());
        registry.insert("anthropic", client);
        assert_eq!(registry.names(), vec!["anthropic", "openai"]);
        assert!(registry.resolve(Some("gemini"), "openai").is_err());
        assert!(registry.resolve(None, "openai").is_ok());
    }
}
