//! Wiring of the engine's services from configuration.

use std::sync::Arc;
use tracing::info;

use crate::collaborators::{
    HttpRetriever, LlmGenerator, LlmNarrator, ProviderRegistry, Retriever, StaticRetriever,
};
use crate::config::EngineConfig;
use crate::diagnosis::{DiagnosisAnalyzer, DiagnosisService};
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::gateway::AppState;
use crate::runner::BatchEvaluationRunner;
use crate::sampling::{SampleHandler, SamplingQueue};
use crate::store::{open_store, EvaluationStore};

/// All long-lived services, sharing one store and one provider registry.
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<dyn EvaluationStore>,
    pub registry: Arc<ProviderRegistry>,
    pub evaluator: Arc<Evaluator>,
    pub runner: BatchEvaluationRunner,
    pub diagnosis: Arc<DiagnosisService>,
    pub sampling: Option<Arc<SamplingQueue>>,
}

impl Engine {
    /// Validate `config`, open the store and build providers.
    ///
    /// Must be called inside a Tokio runtime when sampling is enabled.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.store)?;
        let registry = Arc::new(ProviderRegistry::from_config(&config));
        let retriever: Arc<dyn Retriever> = match &config.retrieval.endpoint {
            Some(endpoint) => Arc::new(HttpRetriever::new(endpoint.clone(), config.retrieval.timeout_secs)?),
            None => Arc::new(StaticRetriever::new()),
        };
        Ok(Self::with_parts(config, store, registry, retriever))
    }

    /// Assemble the engine from already-built collaborators.
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn EvaluationStore>,
        registry: Arc<ProviderRegistry>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        let evaluator = Arc::new(Evaluator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.judge.clone(),
        ));
        let runner = BatchEvaluationRunner::new(
            Arc::clone(&store),
            retriever,
            Arc::new(LlmGenerator::new(Arc::clone(&registry))),
            Arc::clone(&evaluator),
            config.batch.clone(),
        );

        let analyzer = DiagnosisAnalyzer::new(config.diagnosis.clone()).with_top_k(config.batch.default_top_k);
        let mut diagnosis = DiagnosisService::new(Arc::clone(&store), analyzer);
        if let Ok(client) = registry.resolve(None, registry.default_judge()) {
            diagnosis = diagnosis.with_narrator(Arc::new(LlmNarrator::new(client.clone())));
        }

        let sampling = config.sampling.enabled.then(|| {
            let handler: Arc<dyn SampleHandler> = evaluator.clone();
            Arc::new(SamplingQueue::start(&config.sampling, handler))
        });

        info!(
            providers = ?registry.names(),
            store = ?config.store.backend,
            sampling = config.sampling.enabled,
            "Engine ready"
        );
        Self {
            config,
            store,
            registry,
            evaluator,
            runner,
            diagnosis: Arc::new(diagnosis),
            sampling,
        }
    }

    pub fn app_state(&self) -> AppState {
        let state = AppState::new(
            Arc::clone(&self.store),
            Arc::clone(&self.evaluator),
            self.runner.clone(),
            Arc::clone(&self.diagnosis),
        );
        match &self.sampling {
            Some(queue) => state.with_sampling(Arc::clone(queue)),
            None => state,
        }
    }

    /// Drain background work.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.sampling {
            queue.shutdown().await;
        }
    }
}
