//! Route handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use uuid::Uuid;

use super::{ApiJson, ApiPath, ApiQuery, ApiResult, AppState};
use crate::claims::ClaimComparison;
use crate::diagnosis::{Alert, DiagnosisReport, DiagnosisSummary, Severity};
use crate::error::ValidationError;
use crate::evaluator::{BatchEvaluationReport, EvaluateQueryRequest, NewInteraction};
use crate::runner::RunRequest;
use crate::store::{EvaluationFilter, GoldenSetUpdate};
use crate::types::{EvaluationRecord, EvaluationRun, GoldenSet, NewTestCase, QueryRecord, TestCase, TestCaseResult};

const MAX_PAGE: usize = 500;

pub(super) async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sampling = state.sampling.as_ref().map(|queue| {
        let stats = queue.stats();
        serde_json::json!({
            "queued": stats.queued.load(Ordering::Relaxed),
            "dropped": stats.dropped.load(Ordering::Relaxed),
            "processed": stats.processed.load(Ordering::Relaxed),
            "failed": stats.failed.load(Ordering::Relaxed),
        })
    });
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "providers": state.evaluator.registry().names(),
        "sampling": sampling,
    }))
}

// Queries

pub(super) async fn record_query(
    State(state): State<AppState>,
    ApiJson(interaction): ApiJson<NewInteraction>,
) -> ApiResult<impl IntoResponse> {
    let record = state.evaluator.record_interaction(interaction).await?;
    let sampling = match &state.sampling {
        Some(queue) => queue.maybe_submit(record.id).as_str(),
        None => "disabled",
    };
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "query": record, "sampling": sampling })),
    ))
}

pub(super) async fn get_query(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Json<QueryRecord>> {
    Ok(Json(state.store.require_query(id).await?))
}

// Evaluations

pub(super) async fn evaluate_query(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<EvaluateQueryRequest>,
) -> ApiResult<Json<EvaluationRecord>> {
    Ok(Json(state.evaluator.evaluate_query(&request).await?))
}

#[derive(Debug, Deserialize)]
pub(super) struct BatchRequest {
    #[serde(default)]
    batch_name: Option<String>,
    query_ids: Vec<Uuid>,
    #[serde(default)]
    evaluator_provider: Option<String>,
}

pub(super) async fn evaluate_batch(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<BatchRequest>,
) -> ApiResult<Json<BatchEvaluationReport>> {
    let batch_name = request
        .batch_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("batch-{}", Utc::now().format("%Y%m%dT%H%M%S")));
    let report = state
        .evaluator
        .evaluate_queries(&batch_name, &request.query_ids, request.evaluator_provider)
        .await?;
    Ok(Json(report))
}

pub(super) async fn list_evaluations(
    State(state): State<AppState>,
    ApiQuery(mut filter): ApiQuery<EvaluationFilter>,
) -> ApiResult<Json<Vec<EvaluationRecord>>> {
    filter.limit = filter.limit.clamp(1, MAX_PAGE);
    Ok(Json(state.store.list_evaluations(&filter).await?))
}

pub(super) async fn get_evaluation(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<EvaluationRecord>> {
    let record = state
        .store
        .get_evaluation(id)
        .await?
        .ok_or_else(|| ValidationError::not_found("Evaluation", id))?;
    Ok(Json(record))
}

pub(super) async fn evaluations_for_query(
    State(state): State<AppState>,
    ApiPath(query_id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<EvaluationRecord>>> {
    let filter = EvaluationFilter {
        query_id: Some(query_id),
        limit: MAX_PAGE,
        ..Default::default()
    };
    Ok(Json(state.store.list_evaluations(&filter).await?))
}

// Golden sets

#[derive(Debug, Deserialize)]
pub(super) struct CreateGoldenSet {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

pub(super) async fn create_golden_set(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateGoldenSet>,
) -> ApiResult<impl IntoResponse> {
    let set = state.store.create_golden_set(&request.name, request.description).await?;
    Ok((StatusCode::CREATED, Json(set)))
}

pub(super) async fn list_golden_sets(State(state): State<AppState>) -> ApiResult<Json<Vec<GoldenSet>>> {
    Ok(Json(state.store.list_golden_sets().await?))
}

pub(super) async fn get_golden_set(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Json<GoldenSet>> {
    Ok(Json(state.store.require_golden_set(id).await?))
}

pub(super) async fn update_golden_set(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(update): ApiJson<GoldenSetUpdate>,
) -> ApiResult<Json<GoldenSet>> {
    Ok(Json(state.store.update_golden_set(id, update).await?))
}

pub(super) async fn delete_golden_set(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> ApiResult<StatusCode> {
    state.store.delete_golden_set(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn add_test_case(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(case): ApiJson<NewTestCase>,
) -> ApiResult<impl IntoResponse> {
    let case = state.store.add_test_case(id, case).await?;
    Ok((StatusCode::CREATED, Json(case)))
}

#[derive(Debug, Deserialize)]
pub(super) struct BulkCases {
    cases: Vec<NewTestCase>,
}

pub(super) async fn add_test_cases(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(bulk): ApiJson<BulkCases>,
) -> ApiResult<impl IntoResponse> {
    if bulk.cases.is_empty() {
        return Err(ValidationError::empty("cases").into());
    }
    let cases = state.store.add_test_cases(id, bulk.cases).await?;
    Ok((StatusCode::CREATED, Json(cases)))
}

pub(super) async fn get_test_case(
    State(state): State<AppState>,
    ApiPath((id, case_id)): ApiPath<(Uuid, Uuid)>,
) -> ApiResult<Json<TestCase>> {
    let set = state.store.require_golden_set(id).await?;
    let case = set
        .cases
        .into_iter()
        .find(|c| c.id == case_id)
        .ok_or_else(|| ValidationError::not_found("Test case", case_id))?;
    Ok(Json(case))
}

pub(super) async fn update_test_case(
    State(state): State<AppState>,
    ApiPath((id, case_id)): ApiPath<(Uuid, Uuid)>,
    ApiJson(case): ApiJson<NewTestCase>,
) -> ApiResult<Json<TestCase>> {
    Ok(Json(state.store.update_test_case(id, case_id, case).await?))
}

pub(super) async fn delete_test_case(
    State(state): State<AppState>,
    ApiPath((id, case_id)): ApiPath<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.store.delete_test_case(id, case_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Runs

pub(super) async fn start_run(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<RunRequest>,
) -> ApiResult<impl IntoResponse> {
    let run = state.runner.start_run(id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

pub(super) async fn list_runs(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Json<Vec<EvaluationRun>>> {
    Ok(Json(state.runner.list_runs(id).await?))
}

/// Load a run, checking that it belongs to the golden set in the path.
async fn run_in_set(state: &AppState, set_id: Uuid, run_id: Uuid) -> ApiResult<EvaluationRun> {
    let run = state.runner.get_run(run_id).await?;
    if run.test_set_id != set_id {
        return Err(ValidationError::not_found("Evaluation run", run_id).into());
    }
    Ok(run)
}

pub(super) async fn get_run(
    State(state): State<AppState>,
    ApiPath((id, run_id)): ApiPath<(Uuid, Uuid)>,
) -> ApiResult<Json<EvaluationRun>> {
    Ok(Json(run_in_set(&state, id, run_id).await?))
}

pub(super) async fn cancel_run(
    State(state): State<AppState>,
    ApiPath((id, run_id)): ApiPath<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    run_in_set(&state, id, run_id).await?;
    state.runner.cancel_run(run_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id, "status": "cancelling" })),
    ))
}

pub(super) async fn run_results(
    State(state): State<AppState>,
    ApiPath((id, run_id)): ApiPath<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<TestCaseResult>>> {
    Ok(Json(run_in_set(&state, id, run_id).await?.results))
}

// Diagnosis

#[derive(Debug, Deserialize)]
pub(super) struct PeriodParams {
    #[serde(default)]
    days: Option<u32>,
    #[serde(default)]
    severity: Option<String>,
}

pub(super) async fn diagnosis_summary(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<PeriodParams>,
) -> ApiResult<Json<DiagnosisSummary>> {
    Ok(Json(state.diagnosis.summary(params.days).await?))
}

pub(super) async fn diagnosis_report(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<PeriodParams>,
) -> ApiResult<Json<DiagnosisReport>> {
    Ok(Json(state.diagnosis.report(params.days).await?))
}

pub(super) async fn diagnosis_alerts(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<PeriodParams>,
) -> ApiResult<Json<Vec<Alert>>> {
    let severity = params
        .severity
        .as_deref()
        .map(str::parse::<Severity>)
        .transpose()?;
    Ok(Json(state.diagnosis.alerts(params.days, severity).await?))
}

// Claims

#[derive(Debug, Deserialize)]
pub(super) struct CompareRequest {
    expected_answer: String,
    generated_answer: String,
    #[serde(default)]
    evaluator_provider: Option<String>,
}

pub(super) async fn compare_claims(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CompareRequest>,
) -> ApiResult<Json<ClaimComparison>> {
    let comparison = state
        .evaluator
        .compare_claims(
            &request.expected_answer,
            &request.generated_answer,
            request.evaluator_provider.as_deref(),
        )
        .await?;
    Ok(Json(comparison))
}
