//! Single and batch evaluation of stored chatbot interactions.
//!
//! An evaluation combines the LLM judge with retrieval metrics (when ground
//! truth document ids are known) and appends one immutable
//! [`EvaluationRecord`] to the store.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::claims::{ClaimComparator, ClaimComparison};
use crate::collaborators::{Generation, ProviderRegistry};
use crate::config::JudgeConfig;
use crate::error::{Result, ValidationError};
use crate::judge::{JudgeInput, JudgeVerdict, ResponseJudge};
use crate::metrics::{RetrievalMetrics, RetrievalMetricsCalculator};
use crate::store::EvaluationStore;
use crate::types::{
    CriterionScores, EvaluationMetadata, EvaluationRecord, EvaluationScores, EvaluationType,
    EvaluatorIdentity, QueryRecord, RetrievedDocument, StoredResponse, TestCase,
};

/// Cutoffs used for single-query retrieval metrics.
pub const QUERY_K_VALUES: [usize; 3] = [1, 3, 5];

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateQueryRequest {
    pub query_id: Uuid,
    #[serde(default)]
    pub expected_category: Option<String>,
    #[serde(default)]
    pub expected_intent: Option<String>,
    #[serde(default)]
    pub relevant_doc_ids: Option<Vec<String>>,
    #[serde(default)]
    pub evaluator_provider: Option<String>,
    /// Run the LLM judge. With `false`, only retrieval metrics are computed.
    #[serde(default = "default_true")]
    pub judge: bool,
    /// Batch the evaluation belongs to, recorded in the metadata.
    #[serde(default)]
    pub batch_name: Option<String>,
}

impl EvaluateQueryRequest {
    pub fn new(query_id: Uuid) -> Self {
        Self {
            query_id,
            expected_category: None,
            expected_intent: None,
            relevant_doc_ids: None,
            evaluator_provider: None,
            judge: true,
            batch_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub id: Uuid,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchScoreSummary {
    pub avg_score: Option<f64>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvaluationReport {
    pub batch_name: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<EvaluationRecord>,
    pub errors: Vec<BatchItemError>,
    pub summary: BatchScoreSummary,
}

/// A chat interaction to store, as reported by the chat path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInteraction {
    pub query: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    pub response: StoredResponse,
}

fn judge_metrics_used() -> BTreeSet<String> {
    CriterionScores::NAMES
        .iter()
        .map(|n| n.to_string())
        .chain(std::iter::once("overall_score".to_string()))
        .collect()
}

fn retrieval_metrics_used(metrics: &RetrievalMetrics) -> BTreeSet<String> {
    let mut used = BTreeSet::from(["mrr".to_string(), "average_precision".to_string()]);
    for k in metrics.precision_at_k.keys() {
        used.insert(format!("precision@{k}"));
        used.insert(format!("recall@{k}"));
        used.insert(format!("f1@{k}"));
    }
    used
}

fn apply_verdict(metadata: &mut EvaluationMetadata, verdict: &JudgeVerdict) {
    metadata.explanation = verdict.explanation.clone();
    metadata.strengths = verdict.strengths.clone();
    metadata.weaknesses = verdict.weaknesses.clone();
    metadata.suggested_improvement = verdict.suggested_improvement.clone();
    metadata.metrics_used.extend(judge_metrics_used());
}

pub struct Evaluator {
    store: Arc<dyn EvaluationStore>,
    registry: Arc<ProviderRegistry>,
    judge_config: JudgeConfig,
    calculator: RetrievalMetricsCalculator,
}

impl Evaluator {
    pub fn new(store: Arc<dyn EvaluationStore>, registry: Arc<ProviderRegistry>, judge_config: JudgeConfig) -> Self {
        Self {
            store,
            registry,
            judge_config,
            calculator: RetrievalMetricsCalculator::new(QUERY_K_VALUES),
        }
    }

    pub fn store(&self) -> &Arc<dyn EvaluationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn judge(&self, provider: Option<&str>) -> Result<ResponseJudge> {
        let client = self
            .registry
            .resolve(provider, self.registry.default_judge())?
            .clone()
            .with_timeout(Duration::from_secs(self.judge_config.timeout_secs));
        Ok(ResponseJudge::new(client, self.judge_config.clone()))
    }

    /// Store a chat interaction so it can be evaluated later.
    pub async fn record_interaction(&self, interaction: NewInteraction) -> Result<QueryRecord> {
        if interaction.query.trim().is_empty() {
            return Err(ValidationError::empty("query").into());
        }
        let record = QueryRecord::new(interaction.query)
            .with_classification(interaction.category, interaction.intent)
            .with_response(interaction.response);
        self.store.save_query(record.clone()).await?;
        Ok(record)
    }

    /// Evaluate one stored query and append the resulting record.
    pub async fn evaluate_query(&self, request: &EvaluateQueryRequest) -> Result<EvaluationRecord> {
        let query = self.store.require_query(request.query_id).await?;
        let response = query.response.as_ref().ok_or_else(|| {
            ValidationError::invalid("query_id", format!("query {} has no stored response", query.id))
        })?;
        let relevant: Option<HashSet<String>> = request
            .relevant_doc_ids
            .as_ref()
            .filter(|ids| !ids.is_empty())
            .map(|ids| ids.iter().cloned().collect());
        if !request.judge && relevant.is_none() {
            return Err(ValidationError::invalid(
                "relevant_doc_ids",
                "required when the judge is disabled",
            )
            .into());
        }

        let mut metadata = EvaluationMetadata {
            expected_category: request.expected_category.clone(),
            expected_intent: request.expected_intent.clone(),
            category: query.category.clone(),
            intent: query.intent.clone(),
            query_text: Some(query.text.clone()),
            has_ground_truth: relevant.is_some(),
            batch_name: request.batch_name.clone(),
            ..Default::default()
        };

        let retrieval = relevant.map(|relevant| {
            let metrics = self.calculator.calculate_for_documents(&response.contexts, &relevant);
            metadata.metrics_used.extend(retrieval_metrics_used(&metrics));
            metrics
        });

        let (evaluation_type, scores, evaluator) = if request.judge {
            let input = JudgeInput::new(&query.text, &response.answer)
                .with_contexts(response.contexts.clone())
                .with_expected(request.expected_category.clone(), request.expected_intent.clone());
            let verdict = self
                .judge(request.evaluator_provider.as_deref())?
                .evaluate(&input)
                .await?;
            apply_verdict(&mut metadata, &verdict);
            let mut scores = verdict.scores.clone();
            if let Some(metrics) = retrieval {
                scores = scores.with_retrieval(metrics);
            }
            (EvaluationType::LlmJudge, scores, verdict.evaluator)
        } else {
            let metrics = retrieval.ok_or_else(|| ValidationError::empty("relevant_doc_ids"))?;
            (
                EvaluationType::Retrieval,
                EvaluationScores::retrieval_only(metrics),
                EvaluatorIdentity::new("raglens", "retrieval-metrics"),
            )
        };

        let record = EvaluationRecord::new(query.id, evaluation_type, scores, evaluator, metadata);
        self.store.append_evaluation(record.clone()).await?;
        info!(
            query_id = %query.id,
            evaluation_id = %record.id,
            evaluation_type = %record.evaluation_type,
            overall_score = ?record.overall_score(),
            "Query evaluated"
        );
        Ok(record)
    }

    /// Evaluate many stored queries. Each id is isolated from the others.
    pub async fn evaluate_queries(
        &self,
        batch_name: &str,
        query_ids: &[Uuid],
        evaluator_provider: Option<String>,
    ) -> Result<BatchEvaluationReport> {
        if query_ids.is_empty() {
            return Err(ValidationError::empty("query_ids").into());
        }
        let outcomes: Vec<(Uuid, Result<EvaluationRecord>)> = stream::iter(query_ids.iter().copied())
            .map(|id| {
                let mut request = EvaluateQueryRequest::new(id);
                request.evaluator_provider = evaluator_provider.clone();
                request.batch_name = Some(batch_name.to_string());
                async move { (id, self.evaluate_query(&request).await) }
            })
            .buffered(self.judge_config.concurrency.max(1))
            .collect()
            .await;

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(record) => results.push(record),
                Err(e) => {
                    warn!(query_id = %id, kind = e.kind(), error = %e, "Batch item failed");
                    errors.push(BatchItemError {
                        id,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let scores: Vec<f64> = results.iter().filter_map(|r| r.overall_score()).collect();
        let summary = BatchScoreSummary {
            avg_score: (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64),
            min_score: scores.iter().copied().reduce(f64::min),
            max_score: scores.iter().copied().reduce(f64::max),
        };
        info!(
            batch_name,
            total = query_ids.len(),
            successful = results.len(),
            failed = errors.len(),
            "Batch evaluation finished"
        );

        Ok(BatchEvaluationReport {
            batch_name: batch_name.to_string(),
            total: query_ids.len(),
            successful: results.len(),
            failed: errors.len(),
            results,
            errors,
            summary,
        })
    }

    /// Judge a golden-set answer against its reference and record it in the history.
    pub async fn evaluate_golden_case(
        &self,
        run_id: Uuid,
        case: &TestCase,
        generation: &Generation,
        contexts: &[RetrievedDocument],
        evaluator_provider: Option<&str>,
    ) -> Result<EvaluationScores> {
        let input = JudgeInput::new(&case.query, &generation.answer)
            .with_contexts(contexts.to_vec())
            .with_expected(case.category.clone(), case.intent.clone())
            .with_reference(&case.expected_answer);
        let verdict = self.judge(evaluator_provider)?.evaluate(&input).await?;

        let mut metadata = EvaluationMetadata {
            expected_category: case.category.clone(),
            expected_intent: case.intent.clone(),
            query_text: Some(case.query.clone()),
            has_ground_truth: !case.relevant_doc_ids.is_empty(),
            run_id: Some(run_id),
            test_case_id: Some(case.id),
            ..Default::default()
        };
        apply_verdict(&mut metadata, &verdict);

        let mut scores = verdict.scores.clone();
        if !case.relevant_doc_ids.is_empty() {
            let relevant: HashSet<String> = case.relevant_doc_ids.iter().cloned().collect();
            let metrics = self.calculator.calculate_for_documents(contexts, &relevant);
            metadata.metrics_used.extend(retrieval_metrics_used(&metrics));
            scores = scores.with_retrieval(metrics);
        }

        let query = QueryRecord::new(&case.query)
            .with_classification(case.category.clone(), case.intent.clone())
            .with_response(StoredResponse {
                answer: generation.answer.clone(),
                contexts: contexts.to_vec(),
                provider: generation.provider.clone(),
                model: generation.model.clone(),
                latency_ms: generation.latency_ms,
                token_usage: generation.token_usage,
                cost: generation.cost_estimate,
            });
        let query_id = query.id;
        self.store.save_query(query).await?;
        let record = EvaluationRecord::new(
            query_id,
            EvaluationType::GoldenSet,
            scores.clone(),
            verdict.evaluator,
            metadata,
        );
        self.store.append_evaluation(record).await?;
        Ok(scores)
    }

    /// Claim-level comparison of an expected and a generated answer.
    pub async fn compare_claims(
        &self,
        expected: &str,
        generated: &str,
        provider: Option<&str>,
    ) -> Result<ClaimComparison> {
        let client = self.registry.resolve(provider, self.registry.default_judge())?.clone();
        ClaimComparator::new(client).compare(expected, generated).await
    }
}
