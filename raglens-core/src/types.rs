//! Core type definitions for the evaluation engine.
//!
//! Defines the records the engine produces and consumes: retrieved documents,
//! score bundles, append-only evaluation records, golden sets and their test
//! cases, and evaluation runs with their per-case results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::metrics::RetrievalMetrics;

/// A document returned by the retrieval collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub text: String,
    /// Similarity in `[0, 1]` as reported by the retriever.
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RetrievedDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>, relevance_score: f64) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            relevance_score: relevance_score.clamp(0.0, 1.0),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn category(&self) -> Option<&str> {
        self.metadata_str("category")
    }

    pub fn intent(&self) -> Option<&str> {
        self.metadata_str("intent")
    }

    /// Language-variation flags attached by the ingestion pipeline (e.g. "B", "Q", "Z").
    pub fn flags(&self) -> Vec<&str> {
        match self.metadata.get("flags") {
            Some(serde_json::Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).collect(),
            Some(serde_json::Value::String(s)) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect(),
            _ => Vec::new(),
        }
    }
}

/// The six rubric criteria scored by the judge, each an integer in `0..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionScores {
    pub accuracy: u8,
    pub completeness: u8,
    pub faithfulness: u8,
    pub tone: u8,
    pub relevance: u8,
    pub clarity: u8,
}

impl CriterionScores {
    pub const MAX: u8 = 5;
    pub const NAMES: [&'static str; 6] = [
        "accuracy",
        "completeness",
        "faithfulness",
        "tone",
        "relevance",
        "clarity",
    ];

    pub fn values(&self) -> [u8; 6] {
        [
            self.accuracy,
            self.completeness,
            self.faithfulness,
            self.tone,
            self.relevance,
            self.clarity,
        ]
    }

    /// `mean(criteria) / 5`, always in `[0, 1]` for valid scores.
    pub fn overall(&self) -> f64 {
        let sum: u32 = self.values().iter().map(|&v| u32::from(v)).sum();
        f64::from(sum) / 6.0 / f64::from(Self::MAX)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, value) in Self::NAMES.iter().zip(self.values()) {
            if value > Self::MAX {
                return Err(ValidationError::invalid(
                    *name,
                    format!("score {value} is outside 0..=5"),
                ));
            }
        }
        Ok(())
    }
}

/// Scores attached to an evaluation record.
///
/// `overall_score` is derived from `criteria` and cannot be set directly.
/// Deserialization recomputes it, so a stored or transmitted value never
/// overrides the formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ScoresRepr", into = "ScoresRepr")]
pub struct EvaluationScores {
    criteria: Option<CriterionScores>,
    overall_score: Option<f64>,
    retrieval: Option<RetrievalMetrics>,
}

#[derive(Serialize, Deserialize)]
struct ScoresRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    criteria: Option<CriterionScores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    overall_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retrieval: Option<RetrievalMetrics>,
}

impl From<ScoresRepr> for EvaluationScores {
    fn from(repr: ScoresRepr) -> Self {
        let mut scores = match repr.criteria {
            Some(criteria) => Self::from_criteria(criteria),
            None => Self::empty(),
        };
        scores.retrieval = repr.retrieval;
        scores
    }
}

impl From<EvaluationScores> for ScoresRepr {
    fn from(scores: EvaluationScores) -> Self {
        Self {
            criteria: scores.criteria,
            overall_score: scores.overall_score,
            retrieval: scores.retrieval,
        }
    }
}

impl EvaluationScores {
    fn empty() -> Self {
        Self {
            criteria: None,
            overall_score: None,
            retrieval: None,
        }
    }

    pub fn from_criteria(criteria: CriterionScores) -> Self {
        Self {
            criteria: Some(criteria),
            overall_score: Some(criteria.overall()),
            retrieval: None,
        }
    }

    /// Scores for a retrieval-only evaluation. Such records carry no overall score.
    pub fn retrieval_only(metrics: RetrievalMetrics) -> Self {
        Self {
            retrieval: Some(metrics),
            ..Self::empty()
        }
    }

    pub fn with_retrieval(mut self, metrics: RetrievalMetrics) -> Self {
        self.retrieval = Some(metrics);
        self
    }

    pub fn criteria(&self) -> Option<&CriterionScores> {
        self.criteria.as_ref()
    }

    pub fn overall_score(&self) -> Option<f64> {
        self.overall_score
    }

    pub fn retrieval(&self) -> Option<&RetrievalMetrics> {
        self.retrieval.as_ref()
    }
}

/// Which pipeline produced an evaluation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationType {
    LlmJudge,
    Retrieval,
    GoldenSet,
}

impl EvaluationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmJudge => "llm_judge",
            Self::Retrieval => "retrieval",
            Self::GoldenSet => "golden_set",
        }
    }
}

impl std::fmt::Display for EvaluationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EvaluationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm_judge" => Ok(Self::LlmJudge),
            "retrieval" => Ok(Self::Retrieval),
            "golden_set" => Ok(Self::GoldenSet),
            other => Err(ValidationError::invalid(
                "evaluation_type",
                format!("unknown evaluation type '{other}'"),
            )),
        }
    }
}

/// Provider and model that produced a set of scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorIdentity {
    pub provider: String,
    pub model: String,
}

impl EvaluatorIdentity {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Display for EvaluatorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_intent: Option<String>,
    /// Category the chatbot assigned to the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_text: Option<String>,
    #[serde(default)]
    pub has_ground_truth: bool,
    #[serde(default)]
    pub metrics_used: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_improvement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<Uuid>,
}

/// One immutable evaluation of a query. Corrections are new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: Uuid,
    pub query_id: Uuid,
    pub evaluation_type: EvaluationType,
    pub scores: EvaluationScores,
    pub evaluator: EvaluatorIdentity,
    pub metadata: EvaluationMetadata,
    pub timestamp: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn new(
        query_id: Uuid,
        evaluation_type: EvaluationType,
        scores: EvaluationScores,
        evaluator: EvaluatorIdentity,
        metadata: EvaluationMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            query_id,
            evaluation_type,
            scores,
            evaluator,
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn overall_score(&self) -> Option<f64> {
        self.scores.overall_score()
    }

    /// Observed category, falling back to the expected one.
    pub fn category(&self) -> Option<&str> {
        self.metadata
            .category
            .as_deref()
            .or(self.metadata.expected_category.as_deref())
    }

    pub fn intent(&self) -> Option<&str> {
        self.metadata
            .intent
            .as_deref()
            .or(self.metadata.expected_intent.as_deref())
    }
}

/// Token counts reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Cost in USD for one or more provider calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_cost: f64,
    pub output_cost: f64,
}

impl CostEstimate {
    pub fn total(&self) -> f64 {
        self.input_cost + self.output_cost
    }

    pub fn accumulate(&mut self, other: &CostEstimate) {
        self.input_cost += other.input_cost;
        self.output_cost += other.output_cost;
    }
}

/// The chatbot's stored answer to a query, with the context it was grounded on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub answer: String,
    #[serde(default)]
    pub contexts: Vec<RetrievedDocument>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub cost: CostEstimate,
}

/// A user query as recorded by the chat path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: Uuid,
    pub text: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub response: Option<StoredResponse>,
    pub created_at: DateTime<Utc>,
}

impl QueryRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            category: None,
            intent: None,
            response: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_classification(mut self, category: Option<String>, intent: Option<String>) -> Self {
        self.category = category;
        self.intent = intent;
        self
    }

    pub fn with_response(mut self, response: StoredResponse) -> Self {
        self.response = Some(response);
        self
    }
}

/// A curated (query, expected answer) pair owned by a golden set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub query: String,
    pub expected_answer: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    /// Ground-truth document ids, when known.
    #[serde(default)]
    pub relevant_doc_ids: Vec<String>,
}

/// Input for creating or replacing a test case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTestCase {
    pub query: String,
    pub expected_answer: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub relevant_doc_ids: Vec<String>,
}

impl NewTestCase {
    pub fn new(query: impl Into<String>, expected_answer: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            expected_answer: expected_answer.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.query.trim().is_empty() {
            return Err(ValidationError::empty("query"));
        }
        if self.expected_answer.trim().is_empty() {
            return Err(ValidationError::empty("expected_answer"));
        }
        Ok(())
    }

    pub fn into_test_case(self) -> TestCase {
        TestCase {
            id: Uuid::new_v4(),
            query: self.query,
            expected_answer: self.expected_answer,
            category: self.category,
            intent: self.intent,
            relevant_doc_ids: self.relevant_doc_ids,
        }
    }
}

/// A named, versioned collection of test cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenSet {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Incremented on every mutation of the set or its cases.
    pub version: u32,
    pub cases: Vec<TestCase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GoldenSet {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description,
            version: 1,
            cases: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// Lifecycle state of an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Transitions are monotonic: pending -> running -> completed | failed.
    /// A pending run may also fail directly (e.g. cancelled before it started).
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Value copy of the run parameters taken at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfigSnapshot {
    pub llm_provider: String,
    pub evaluator_provider: String,
    pub top_k: usize,
    #[serde(default)]
    pub run_name: Option<String>,
    pub pass_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Success,
    Error,
}

/// Why a unit of work failed, with a machine-readable kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl From<&crate::error::RaglensError> for ErrorDetail {
    fn from(err: &crate::error::RaglensError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub test_case_id: Uuid,
    pub query: String,
    pub expected_answer: String,
    #[serde(default)]
    pub generated_answer: Option<String>,
    #[serde(default)]
    pub overall_score: Option<f64>,
    #[serde(default)]
    pub scores: Option<EvaluationScores>,
    pub status: CaseStatus,
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
    /// Retrieved context, kept for source inspection.
    #[serde(default)]
    pub sources: Vec<RetrievedDocument>,
}

impl TestCaseResult {
    pub fn success(
        case: &TestCase,
        generated_answer: String,
        scores: EvaluationScores,
        sources: Vec<RetrievedDocument>,
    ) -> Self {
        Self {
            test_case_id: case.id,
            query: case.query.clone(),
            expected_answer: case.expected_answer.clone(),
            generated_answer: Some(generated_answer),
            overall_score: scores.overall_score(),
            scores: Some(scores),
            status: CaseStatus::Success,
            error_detail: None,
            sources,
        }
    }

    pub fn error(case: &TestCase, detail: ErrorDetail) -> Self {
        Self {
            test_case_id: case.id,
            query: case.query.clone(),
            expected_answer: case.expected_answer.clone(),
            generated_answer: None,
            overall_score: None,
            scores: None,
            status: CaseStatus::Error,
            error_detail: Some(detail),
            sources: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CaseStatus::Success
    }
}

/// Aggregate outcome of a run. `completed + failed == total_cases` once frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_cases: usize,
    pub completed: usize,
    pub failed: usize,
    pub avg_score: f64,
    pub pass_rate: f64,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub max_score: Option<f64>,
    pub evaluation_type: EvaluationType,
}

impl RunSummary {
    pub fn empty() -> Self {
        Self {
            total_cases: 0,
            completed: 0,
            failed: 0,
            avg_score: 0.0,
            pass_rate: 0.0,
            min_score: None,
            max_score: None,
            evaluation_type: EvaluationType::GoldenSet,
        }
    }
}

/// One batch evaluation of a golden set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub id: Uuid,
    pub test_set_id: Uuid,
    pub status: RunStatus,
    pub config_snapshot: RunConfigSnapshot,
    pub results: Vec<TestCaseResult>,
    pub summary: RunSummary,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl EvaluationRun {
    pub fn new(test_set_id: Uuid, config_snapshot: RunConfigSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            test_set_id,
            status: RunStatus::Pending,
            config_snapshot,
            results: Vec::new(),
            summary: RunSummary::empty(),
            started_at: Utc::now(),
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), crate::error::RunError> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::RunError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}
