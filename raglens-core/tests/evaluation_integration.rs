//! Judge and query evaluation flows through the engine.

mod common;

use common::{client, engine_with, scripted_provider, test_config, verdict};
use pretty_assertions::assert_eq;
use raglens_core::brain::MockLlmProvider;
use raglens_core::config::JudgeConfig;
use raglens_core::error::ProviderError;
use raglens_core::evaluator::{EvaluateQueryRequest, NewInteraction};
use raglens_core::judge::{JudgeInput, ResponseJudge};
use raglens_core::sampling::SubmitOutcome;
use raglens_core::store::EvaluationFilter;
use raglens_core::types::{EvaluationType, RetrievedDocument, StoredResponse};
use std::sync::Arc;
use std::time::Duration;

const SCENARIO_B: &str = r#"Here is my evaluation:
```json
{"scores": {"accuracy": 5, "completeness": 4, "faithfulness": 5, "tone": 5, "relevance": 5, "clarity": 4},
 "overall_score": 4.67, "explanation": "Accurate and friendly.", "strengths": ["grounded"],
 "weaknesses": ["misses the fee"], "suggested_improvement": "Mention the restocking fee."}
```"#;

fn interaction() -> NewInteraction {
    NewInteraction {
        query: "How long does a refund take?".into(),
        category: Some("REFUND".into()),
        intent: Some("get_refund".into()),
        response: StoredResponse {
            answer: "Refunds are issued within 5 business days.".into(),
            contexts: vec![
                RetrievedDocument::new("doc-2", "Orders can be cancelled before shipping.", 0.7),
                RetrievedDocument::new("doc-1", "Refunds are issued within 5 business days.", 0.9),
            ],
            provider: "mock".into(),
            model: "mock-model".into(),
            latency_ms: 120,
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn test_judge_scores_fenced_reply() {
    let mock = Arc::new(MockLlmProvider::with_response(SCENARIO_B));
    let judge = ResponseJudge::new(client(mock.clone()), JudgeConfig::default());
    let verdict = judge
        .evaluate(&JudgeInput::new("How long does a refund take?", "Five business days."))
        .await
        .unwrap();

    let overall = verdict.scores.overall_score().unwrap();
    assert!((overall - 0.9333).abs() < 1e-4);
    assert_eq!(verdict.attempts, 1);
    assert_eq!(verdict.weaknesses, vec!["misses the fee".to_string()]);
    assert_eq!(mock.requests()[0].temperature, 0.0);
}

#[tokio::test]
async fn test_judge_retries_once_then_reports_parsing_error() {
    let recovering = Arc::new(MockLlmProvider::new());
    recovering.queue_response("I think the answer is great!");
    recovering.queue_response(&verdict(3));
    let judge = ResponseJudge::new(client(recovering.clone()), JudgeConfig::default());
    let verdict = judge.evaluate(&JudgeInput::new("q", "a")).await.unwrap();
    assert_eq!(verdict.attempts, 2);
    assert!(recovering.requests()[1].full_text().contains("JSON"));

    let stubborn = Arc::new(MockLlmProvider::with_response("no scores here"));
    let judge = ResponseJudge::new(client(stubborn.clone()), JudgeConfig::default());
    let err = judge.evaluate(&JudgeInput::new("q", "a")).await.unwrap_err();
    assert_eq!(err.kind(), "judge_parsing_error");
    assert_eq!(stubborn.call_count(), 2);
}

#[tokio::test]
async fn test_judge_surfaces_provider_failure_after_retries() {
    let mock = Arc::new(MockLlmProvider::with_handler(|_| {
        Err(ProviderError::RateLimited { retry_after_secs: 0 })
    }));
    let judge = ResponseJudge::new(client(mock.clone()), JudgeConfig::default());
    let err = judge.evaluate(&JudgeInput::new("q", "a")).await.unwrap_err();
    assert_eq!(err.kind(), "transient_provider_error");
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test]
async fn test_evaluate_stored_query_with_ground_truth() {
    let engine = engine_with(Arc::new(scripted_provider("unused", 5)), test_config());
    let query = engine.evaluator.record_interaction(interaction()).await.unwrap();

    let mut request = EvaluateQueryRequest::new(query.id);
    request.relevant_doc_ids = Some(vec!["doc-1".into()]);
    request.expected_category = Some("REFUND".into());
    let record = engine.evaluator.evaluate_query(&request).await.unwrap();

    assert_eq!(record.evaluation_type, EvaluationType::LlmJudge);
    assert_eq!(record.overall_score(), Some(1.0));
    let metrics = record.scores.retrieval().unwrap();
    assert_eq!(metrics.mrr, 0.5);
    assert_eq!(metrics.recall_at_k[&3], 1.0);
    assert!(record.metadata.has_ground_truth);
    assert!(record.metadata.metrics_used.contains("mrr"));
    assert_eq!(record.metadata.category.as_deref(), Some("REFUND"));

    let listed = engine
        .store
        .list_evaluations(&EvaluationFilter {
            query_id: Some(query.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed, vec![record]);
}

#[tokio::test]
async fn test_retrieval_only_evaluation_skips_judge() {
    let mock = Arc::new(MockLlmProvider::new());
    let engine = engine_with(mock.clone(), test_config());
    let query = engine.evaluator.record_interaction(interaction()).await.unwrap();

    let mut request = EvaluateQueryRequest::new(query.id);
    request.judge = false;
    request.relevant_doc_ids = Some(vec!["doc-1".into(), "doc-9".into()]);
    let record = engine.evaluator.evaluate_query(&request).await.unwrap();

    assert_eq!(record.evaluation_type, EvaluationType::Retrieval);
    assert_eq!(record.overall_score(), None);
    assert_eq!(record.scores.retrieval().unwrap().average_precision, 0.25);
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_batch_isolates_missing_queries() {
    let engine = engine_with(Arc::new(scripted_provider("unused", 4)), test_config());
    let first = engine.evaluator.record_interaction(interaction()).await.unwrap();
    let second = engine.evaluator.record_interaction(interaction()).await.unwrap();
    let missing = uuid::Uuid::new_v4();

    let report = engine
        .evaluator
        .evaluate_queries("nightly", &[first.id, missing, second.id], None)
        .await
        .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].id, missing);
    assert_eq!(report.errors[0].kind, "validation_error");
    assert_eq!(report.summary.min_score, Some(0.8));

    let stored = engine.store.list_evaluations(&EvaluationFilter::default()).await.unwrap();
    assert!(stored.iter().all(|r| r.metadata.batch_name.as_deref() == Some("nightly")));
}

#[tokio::test]
async fn test_sampled_interactions_are_evaluated_in_background() {
    let mut config = test_config();
    config.sampling.enabled = true;
    config.sampling.rate = 1.0;
    let engine = engine_with(
        Arc::new(scripted_provider("unused", 4).with_delay(Duration::from_millis(5))),
        config,
    );
    let queue = engine.sampling.clone().unwrap();

    let query = engine.evaluator.record_interaction(interaction()).await.unwrap();
    assert_eq!(queue.maybe_submit(query.id), SubmitOutcome::Queued);
    engine.shutdown().await;

    let records = engine
        .store
        .list_evaluations(&EvaluationFilter {
            query_id: Some(query.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].evaluation_type, EvaluationType::LlmJudge);
}
