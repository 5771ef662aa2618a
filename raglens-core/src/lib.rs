//! # RAGLens Core
//!
//! Evaluation and diagnosis engine for retrieval-augmented chatbots.
//! Provides retrieval metrics, the LLM response judge, claim comparison,
//! golden-set batch runs, history diagnosis, background sampling, the
//! persistence layer, and the REST gateway.

pub mod brain;
pub mod claims;
pub mod collaborators;
pub mod config;
pub mod diagnosis;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod gateway;
pub mod judge;
pub mod metrics;
pub mod providers;
pub mod runner;
pub mod sampling;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{CompletionRequest, CompletionResponse, LlmProvider, MockLlmProvider, ModelClient};
pub use claims::{ClaimComparator, ClaimComparison, ClaimStatus};
pub use collaborators::{
    Generation, Generator, HttpRetriever, LlmGenerator, LlmNarrator, Narrator, ProviderRegistry,
    RetrievalFilter, Retriever, StaticRetriever,
};
pub use config::{EngineConfig, load_config};
pub use diagnosis::{Alert, DiagnosisAnalyzer, DiagnosisReport, DiagnosisService, DiagnosisSummary, Severity};
pub use engine::Engine;
pub use error::{RaglensError, Result};
pub use evaluator::{BatchEvaluationReport, EvaluateQueryRequest, Evaluator, NewInteraction};
pub use judge::{JudgeInput, JudgeVerdict, ResponseJudge};
pub use metrics::{RetrievalMetrics, RetrievalMetricsCalculator};
pub use runner::{BatchEvaluationRunner, RunRequest};
pub use sampling::{SamplingQueue, SubmitOutcome};
pub use store::{EvaluationFilter, EvaluationStore, InMemoryStore, SqliteStore};
pub use types::{
    EvaluationRecord, EvaluationRun, EvaluationScores, EvaluationType, GoldenSet, NewTestCase,
    QueryRecord, RetrievedDocument, RunStatus, TestCase, TestCaseResult,
};
