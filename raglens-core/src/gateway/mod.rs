//! # REST Gateway
//!
//! JSON-over-HTTP surface for the evaluation engine, built on axum. Every
//! failure is returned as `{"error": ..., "kind": ...}` with a status code
//! derived from the error kind.

mod handlers;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::GatewayConfig;
use crate::diagnosis::DiagnosisService;
use crate::error::{JudgeError, ProviderError, RaglensError, StoreError, ValidationError};
use crate::evaluator::Evaluator;
use crate::runner::BatchEvaluationRunner;
use crate::sampling::SamplingQueue;
use crate::store::EvaluationStore;

/// Everything a handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EvaluationStore>,
    pub evaluator: Arc<Evaluator>,
    pub runner: BatchEvaluationRunner,
    pub diagnosis: Arc<DiagnosisService>,
    pub sampling: Option<Arc<SamplingQueue>>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        evaluator: Arc<Evaluator>,
        runner: BatchEvaluationRunner,
        diagnosis: Arc<DiagnosisService>,
    ) -> Self {
        Self {
            store,
            evaluator,
            runner,
            diagnosis,
            sampling: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_sampling(mut self, queue: Arc<SamplingQueue>) -> Self {
        self.sampling = Some(queue);
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// An error rendered as a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: String,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(err: &RaglensError) -> StatusCode {
    match err {
        RaglensError::Validation(ValidationError::NotFound { .. }) => StatusCode::NOT_FOUND,
        RaglensError::Validation(_) => StatusCode::BAD_REQUEST,
        RaglensError::Judge(JudgeError::MalformedOutput { .. } | JudgeError::Parsing { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        RaglensError::Provider(ProviderError::UnsupportedProvider { .. })
        | RaglensError::Judge(JudgeError::Provider(ProviderError::UnsupportedProvider { .. })) => {
            StatusCode::BAD_REQUEST
        }
        RaglensError::Provider(_) | RaglensError::Judge(JudgeError::Provider(_)) => StatusCode::BAD_GATEWAY,
        RaglensError::Store(StoreError::Conflict { .. }) | RaglensError::Run(_) => StatusCode::CONFLICT,
        RaglensError::Store(_) | RaglensError::Config(_) | RaglensError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<RaglensError> for ApiError {
    fn from(err: RaglensError) -> Self {
        Self {
            status: status_for(&err),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        RaglensError::from(err).into()
    }
}

macro_rules! rejection_to_api_error {
    ($($rejection:ty),+) => {
        $(impl From<$rejection> for ApiError {
            fn from(rejection: $rejection) -> Self {
                Self {
                    status: rejection.status(),
                    kind: "validation_error".into(),
                    message: rejection.body_text(),
                }
            }
        })+
    };
}

rejection_to_api_error!(JsonRejection, PathRejection, QueryRejection);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, kind = %self.kind, error = %self.message, "Request failed");
        } else {
            debug!(status = %self.status, kind = %self.kind, error = %self.message, "Request rejected");
        }
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

/// `axum::Json` with rejections rendered as [`ApiError`].
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let axum::Json(value) = axum::Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// `axum::extract::Path` with rejections rendered as [`ApiError`].
pub struct ApiPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// `axum::extract::Query` with rejections rendered as [`ApiError`].
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Build the API router.
pub fn router(state: AppState) -> Router {
    use handlers::*;

    Router::new()
        .route("/health", get(health))
        .route("/api/queries", post(record_query))
        .route("/api/queries/{id}", get(get_query))
        .route("/api/evaluations", get(list_evaluations))
        .route("/api/evaluations/run", post(evaluate_query))
        .route("/api/evaluations/batch", post(evaluate_batch))
        .route("/api/evaluations/query/{query_id}", get(evaluations_for_query))
        .route("/api/evaluations/{id}", get(get_evaluation))
        .route("/api/golden-sets", post(create_golden_set).get(list_golden_sets))
        .route(
            "/api/golden-sets/{id}",
            get(get_golden_set).patch(update_golden_set).delete(delete_golden_set),
        )
        .route("/api/golden-sets/{id}/cases", post(add_test_case))
        .route("/api/golden-sets/{id}/cases/bulk", post(add_test_cases))
        .route(
            "/api/golden-sets/{id}/cases/{case_id}",
            get(get_test_case).put(update_test_case).delete(delete_test_case),
        )
        .route("/api/golden-sets/{id}/run", post(start_run))
        .route("/api/golden-sets/{id}/runs", get(list_runs))
        .route("/api/golden-sets/{id}/runs/{run_id}", get(get_run))
        .route("/api/golden-sets/{id}/runs/{run_id}/cancel", post(cancel_run))
        .route("/api/golden-sets/{id}/runs/{run_id}/results", get(run_results))
        .route("/api/diagnosis/summary", get(diagnosis_summary))
        .route("/api/diagnosis/report", get(diagnosis_report))
        .route("/api/diagnosis/alerts", get(diagnosis_alerts))
        .route("/api/claims/compare", post(compare_claims))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    config: &GatewayConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "REST gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("REST gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(RaglensError, StatusCode)> = vec![
            (ValidationError::not_found("Query", "q1").into(), StatusCode::NOT_FOUND),
            (ValidationError::empty("query").into(), StatusCode::BAD_REQUEST),
            (
                JudgeError::Parsing {
                    reason: "no json".into(),
                    raw: "hello".into(),
                }
                .into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ProviderError::Timeout { timeout_secs: 5 }.into(), StatusCode::BAD_GATEWAY),
            (
                JudgeError::Provider(ProviderError::AuthFailed {
                    provider: "anthropic".into(),
                })
                .into(),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ProviderError::UnsupportedProvider { name: "x".into() }.into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                RunError::NotActive {
                    run_id: "r".into(),
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (
                StoreError::Backend {
                    message: "disk".into(),
                }
                .into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status(), expected, "{}", api.message);
        }
    }

    #[test]
    fn test_error_kind_preserved() {
        let api = ApiError::from(RaglensError::from(ProviderError::Timeout { timeout_secs: 5 }));
        assert_eq!(api.kind, "transient_provider_error");
    }
}
