//! Golden-set batch runs.
//!
//! A run snapshots its configuration at launch, then processes every test
//! case under a concurrency ceiling: retrieve, generate, judge, and score
//! retrieval when ground truth is known. Each case is isolated; a failure
//! becomes an `error` result for that case only. Results keep test-case
//! order and the summary always satisfies `completed + failed == total_cases`.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collaborators::{Generator, RetrievalFilter, Retriever};
use crate::config::BatchConfig;
use crate::error::{Result, RunError, ValidationError};
use crate::evaluator::Evaluator;
use crate::store::EvaluationStore;
use crate::types::{
    EvaluationRun, EvaluationType, ErrorDetail, GoldenSet, RunConfigSnapshot, RunStatus, RunSummary,
    TestCase, TestCaseResult,
};

const TERMINAL_SAVE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Parameters for launching a run. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub llm_provider: Option<String>,
    #[serde(default)]
    pub evaluator_provider: Option<String>,
}

/// Freeze the summary from the per-case results.
pub fn summarize(results: &[TestCaseResult], pass_threshold: f64) -> RunSummary {
    let scores: Vec<f64> = results
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| r.overall_score)
        .collect();
    let completed = results.iter().filter(|r| r.is_success()).count();
    let total_cases = results.len();
    let passed = scores.iter().filter(|s| **s >= pass_threshold).count();

    RunSummary {
        total_cases,
        completed,
        failed: total_cases - completed,
        avg_score: if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        },
        pass_rate: if total_cases == 0 {
            0.0
        } else {
            passed as f64 / total_cases as f64
        },
        min_score: scores.iter().copied().reduce(f64::min),
        max_score: scores.iter().copied().reduce(f64::max),
        evaluation_type: EvaluationType::GoldenSet,
    }
}

enum Abandoned {
    Cancelled,
    Aborted,
}

fn abandoned_result(case: &TestCase, reason: Abandoned) -> TestCaseResult {
    let detail = match reason {
        Abandoned::Cancelled => ErrorDetail {
            kind: "cancelled".into(),
            message: "Run was cancelled before this case was evaluated".into(),
        },
        Abandoned::Aborted => ErrorDetail {
            kind: "aborted".into(),
            message: "Run was aborted after repeated case failures".into(),
        },
    };
    TestCaseResult::error(case, detail)
}

#[derive(Clone)]
pub struct BatchEvaluationRunner {
    store: Arc<dyn EvaluationStore>,
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    evaluator: Arc<Evaluator>,
    config: BatchConfig,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl BatchEvaluationRunner {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        evaluator: Arc<Evaluator>,
        config: BatchConfig,
    ) -> Self {
        Self {
            store,
            retriever,
            generator,
            evaluator,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn snapshot(&self, request: &RunRequest) -> Result<RunConfigSnapshot> {
        let registry = self.evaluator.registry();
        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        if top_k == 0 {
            return Err(ValidationError::invalid("top_k", "must be at least 1").into());
        }
        let known = |field: &str, requested: Option<&str>, default: &str| {
            registry
                .resolve(requested, default)
                .map(|_| requested.unwrap_or(default).to_string())
                .map_err(|e| ValidationError::invalid(field, e.to_string()))
        };
        Ok(RunConfigSnapshot {
            llm_provider: known(
                "llm_provider",
                request.llm_provider.as_deref(),
                registry.default_generation(),
            )?,
            evaluator_provider: known(
                "evaluator_provider",
                request.evaluator_provider.as_deref(),
                registry.default_judge(),
            )?,
            top_k,
            run_name: request.run_name.clone(),
            pass_threshold: self.config.pass_threshold,
        })
    }

    async fn prepare(&self, test_set_id: Uuid, request: &RunRequest) -> Result<(EvaluationRun, GoldenSet, CancellationToken)> {
        let set = self.store.require_golden_set(test_set_id).await?;
        let run = EvaluationRun::new(set.id, self.snapshot(request)?);
        self.store.save_run(&run).await?;
        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id, token.clone());
        info!(
            run_id = %run.id,
            test_set_id = %set.id,
            cases = set.cases.len(),
            top_k = run.config_snapshot.top_k,
            "Evaluation run created"
        );
        Ok((run, set, token))
    }

    /// Create a pending run and process it on a background task.
    /// Every call creates a new run; earlier runs are never modified.
    pub async fn start_run(&self, test_set_id: Uuid, request: RunRequest) -> Result<EvaluationRun> {
        let (run, set, token) = self.prepare(test_set_id, &request).await?;
        let runner = self.clone();
        let pending = run.clone();
        tokio::spawn(async move {
            let run_id = run.id;
            if let Err(e) = runner.execute(run, set, token).await {
                error!(run_id = %run_id, error = %e, "Evaluation run could not be persisted");
            }
        });
        Ok(pending)
    }

    /// Create a run and process it on the current task.
    pub async fn run_to_completion(&self, test_set_id: Uuid, request: RunRequest) -> Result<EvaluationRun> {
        let (run, set, token) = self.prepare(test_set_id, &request).await?;
        self.execute(run, set, token).await
    }

    /// Request cancellation of an in-flight run.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let token = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
            .cloned();
        match token {
            Some(token) => {
                info!(run_id = %run_id, "Cancelling evaluation run");
                token.cancel();
                Ok(())
            }
            None => {
                self.store.require_run(run_id).await?;
                Err(RunError::NotActive {
                    run_id: run_id.to_string(),
                }
                .into())
            }
        }
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<EvaluationRun> {
        self.store.require_run(run_id).await
    }

    pub async fn list_runs(&self, test_set_id: Uuid) -> Result<Vec<EvaluationRun>> {
        self.store.require_golden_set(test_set_id).await?;
        self.store.list_runs(test_set_id).await
    }

    pub async fn case_results(&self, run_id: Uuid) -> Result<Vec<TestCaseResult>> {
        Ok(self.store.require_run(run_id).await?.results)
    }

    /// Poll until the run reaches a terminal state.
    pub async fn wait_for_run(&self, run_id: Uuid, poll: Duration) -> Result<EvaluationRun> {
        loop {
            let run = self.store.require_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn process_case(&self, run_id: Uuid, case: &TestCase, snapshot: &RunConfigSnapshot) -> Result<TestCaseResult> {
        let contexts = self
            .retriever
            .retrieve(&case.query, snapshot.top_k, &RetrievalFilter::default())
            .await?;
        let generation = self
            .generator
            .generate(&case.query, &contexts, Some(&snapshot.llm_provider))
            .await?;
        let scores = self
            .evaluator
            .evaluate_golden_case(
                run_id,
                case,
                &generation,
                &contexts,
                Some(&snapshot.evaluator_provider),
            )
            .await?;
        Ok(TestCaseResult::success(case, generation.answer, scores, contexts))
    }

    /// Process the run, then persist its terminal state once it can no longer be cancelled.
    async fn execute(&self, mut run: EvaluationRun, set: GoldenSet, cancel: CancellationToken) -> Result<EvaluationRun> {
        let outcome = self.drive(&mut run, &set, &cancel).await;
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run.id);
        if let Err(e) = outcome {
            error!(run_id = %run.id, kind = e.kind(), error = %e, "Evaluation run failed");
            run.summary = summarize(&run.results, run.config_snapshot.pass_threshold);
            run.failure_reason = Some(e.to_string());
            if !run.status.is_terminal() {
                run.transition(RunStatus::Failed)?;
            }
        }
        self.persist_terminal(&run).await?;

        let duration_ms = (Utc::now() - run.started_at).num_milliseconds();
        info!(
            run_id = %run.id,
            status = %run.status,
            completed = run.summary.completed,
            failed = run.summary.failed,
            avg_score = run.summary.avg_score,
            pass_rate = run.summary.pass_rate,
            failure_reason = ?run.failure_reason,
            duration_ms,
            "Evaluation run finished"
        );
        Ok(run)
    }

    /// Intermediate progress; a failed write is retried by the next checkpoint.
    async fn checkpoint(&self, run: &EvaluationRun) {
        if let Err(e) = self.store.save_run(run).await {
            warn!(run_id = %run.id, error = %e, "Could not checkpoint evaluation run");
        }
    }

    async fn persist_terminal(&self, run: &EvaluationRun) -> Result<()> {
        match self.store.save_run(run).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Saving final run state failed, retrying");
                tokio::time::sleep(TERMINAL_SAVE_RETRY_DELAY).await;
                self.store.save_run(run).await
            }
        }
    }

    /// Leaves `run` in a terminal state; the caller persists it.
    async fn drive(&self, run: &mut EvaluationRun, set: &GoldenSet, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            run.transition(RunStatus::Failed)?;
            run.failure_reason = Some("cancelled".into());
            run.results = set
                .cases
                .iter()
                .map(|c| abandoned_result(c, Abandoned::Cancelled))
                .collect();
            run.summary = summarize(&run.results, run.config_snapshot.pass_threshold);
            return Ok(());
        }

        run.transition(RunStatus::Running)?;
        self.checkpoint(run).await;

        if set.cases.is_empty() {
            warn!(run_id = %run.id, "Golden set has no test cases");
            run.summary = summarize(&[], run.config_snapshot.pass_threshold);
            run.failure_reason = Some("test set has no cases".into());
            run.transition(RunStatus::Failed)?;
            return Ok(());
        }

        let run_id = run.id;
        let snapshot = run.config_snapshot.clone();
        let abort = cancel.child_token();
        let limit = self.config.consecutive_failure_limit;
        let mut consecutive_failures = 0usize;
        let mut aborted = false;

        let case_futures: Vec<_> = set.cases.iter().map(|case| {
                let abort = abort.clone();
                let snapshot = &snapshot;
                async move {
                    if abort.is_cancelled() {
                        let reason = if cancel.is_cancelled() {
                            Abandoned::Cancelled
                        } else {
                            Abandoned::Aborted
                        };
                        return (abandoned_result(case, reason), false);
                    }
                    let result = match self.process_case(run_id, case, snapshot).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(
                                run_id = %run_id,
                                test_case_id = %case.id,
                                kind = e.kind(),
                                error = %e,
                                "Test case failed"
                            );
                            TestCaseResult::error(case, ErrorDetail::from(&e))
                        }
                    };
                    (result, true)
                }
            }).collect();
        let mut results = stream::iter(case_futures)
            .buffered(self.config.concurrency.max(1));

        while let Some((result, evaluated)) = results.next().await {
            if evaluated {
                if result.is_success() {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                    if limit > 0 && consecutive_failures >= limit && !aborted {
                        aborted = true;
                        warn!(
                            run_id = %run_id,
                            consecutive_failures,
                            "Too many consecutive case failures, aborting run"
                        );
                        abort.cancel();
                    }
                }
            }
            run.results.push(result);
            run.summary = summarize(&run.results, snapshot.pass_threshold);
            self.checkpoint(run).await;
        }
        drop(results);

        run.summary = summarize(&run.results, snapshot.pass_threshold);
        if cancel.is_cancelled() {
            run.failure_reason = Some("cancelled".into());
            run.transition(RunStatus::Failed)?;
        } else if aborted {
            run.failure_reason = Some(format!(
                "aborted after {limit} consecutive case failures"
            ));
            run.transition(RunStatus::Failed)?;
        } else {
            run.transition(RunStatus::Completed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CaseStatus, CriterionScores, EvaluationScores};

    fn case(score: Option<f64>) -> TestCaseResult {
        let tc = TestCase {
            id: Uuid::new_v4(),
            query: "q".into(),
            expected_answer: "a".into(),
            category: None,
            intent: None,
            relevant_doc_ids: Vec::new(),
        };
        match score {
            Some(total) => {
                let v = (total * 5.0).round() as u8;
                let scores = EvaluationScores::from_criteria(CriterionScores {
                    accuracy: v,
                    completeness: v,
                    faithfulness: v,
                    tone: v,
                    relevance: v,
                    clarity: v,
                });
                TestCaseResult::success(&tc, "answer".into(), scores, Vec::new())
            }
            None => TestCaseResult::error(
                &tc,
                ErrorDetail {
                    kind: "transient_provider_error".into(),
                    message: "timeout".into(),
                },
            ),
        }
    }

    #[test]
    fn test_summarize_empty() {
        let summary = summarize(&[], 0.7);
        assert_eq!(summary.total_cases, 0);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pass_rate, 0.0);
        assert_eq!(summary.min_score, None);
    }

    #[test]
    fn test_summarize_mixed() {
        let results = vec![case(Some(1.0)), case(Some(0.6)), case(None), case(Some(0.8))];
        let summary = summarize(&results, 0.7);
        assert_eq!(summary.total_cases, 4);
        assert_eq!(summary.completed + summary.failed, summary.total_cases);
        assert_eq!(summary.failed, 1);
        assert!((summary.avg_score - 0.8).abs() < 1e-9);
        assert!((summary.pass_rate - 0.5).abs() < 1e-9);
        assert_eq!(summary.min_score, Some(0.6));
        assert_eq!(summary.max_score, Some(1.0));
        assert_eq!(results[2].status, CaseStatus::Error);
    }

    #[test]
    fn test_abandoned_results_name_their_reason() {
        let tc = TestCase {
            id: Uuid::new_v4(),
            query: "q".into(),
            expected_answer: "a".into(),
            category: None,
            intent: None,
            relevant_doc_ids: Vec::new(),
        };
        let cancelled = abandoned_result(&tc, Abandoned::Cancelled);
        assert_eq!(cancelled.error_detail.unwrap().kind, "cancelled");
        let aborted = abandoned_result(&tc, Abandoned::Aborted);
        assert_eq!(aborted.error_detail.unwrap().kind, "aborted");
    }
}
