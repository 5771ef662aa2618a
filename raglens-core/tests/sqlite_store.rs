//! SQLite persistence across process restarts.

mod common;

use common::{client, corpus, scripted_provider, test_config};
use raglens_core::collaborators::ProviderRegistry;
use raglens_core::config::{StoreBackend, StoreConfig};
use raglens_core::engine::Engine;
use raglens_core::runner::RunRequest;
use raglens_core::store::{EvaluationFilter, EvaluationStore, SqliteStore, open_store};
use raglens_core::types::{EvaluationType, NewTestCase, QueryRecord, RunStatus};
use std::sync::Arc;
use tempfile::TempDir;

fn sqlite_engine(store: Arc<dyn EvaluationStore>) -> Engine {
    let mock = Arc::new(scripted_provider("Refunds take 5 business days.", 4));
    let registry = ProviderRegistry::single("mock", client(mock));
    Engine::with_parts(test_config(), store, Arc::new(registry), corpus())
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("raglens.db");

    let (set_id, run_id, query_id) = {
        let store = SqliteStore::open(&path).unwrap();
        let engine = sqlite_engine(Arc::new(store));

        let query = QueryRecord::new("Where is my refund?");
        engine.store.save_query(query.clone()).await.unwrap();

        let set = engine.store.create_golden_set("refunds", Some("Refund policy".into())).await.unwrap();
        engine
            .store
            .add_test_cases(
                set.id,
                vec![
                    NewTestCase::new("How long do refunds take?", "Five business days."),
                    NewTestCase::new("Is there a fee?", "A 10% restocking fee."),
                ],
            )
            .await
            .unwrap();
        let run = engine
            .runner
            .run_to_completion(set.id, RunRequest::default())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        (set.id, run.id, query.id)
    };

    assert!(path.exists());
    let reopened = SqliteStore::open(&path).unwrap();

    let query = reopened.require_query(query_id).await.unwrap();
    assert_eq!(query.text, "Where is my refund?");

    let set = reopened.require_golden_set(set_id).await.unwrap();
    assert_eq!(set.description.as_deref(), Some("Refund policy"));
    assert_eq!(set.cases.len(), 2);
    assert_eq!(set.cases[0].query, "How long do refunds take?");

    let run = reopened.require_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.summary.completed, 2);
    assert_eq!(run.results.len(), 2);
    assert!(run.completed_at.is_some());

    let history = reopened
        .list_evaluations(&EvaluationFilter {
            evaluation_type: Some(EvaluationType::GoldenSet),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.metadata.run_id == Some(run_id)));

    let runs = reopened.list_runs(set_id).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_open_store_honours_backend() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("configured.db");
    let config = StoreConfig {
        backend: StoreBackend::Sqlite,
        path: Some(path.clone()),
    };

    let store = open_store(&config).unwrap();
    store.create_golden_set("persisted", None).await.unwrap();
    drop(store);

    let again = open_store(&config).unwrap();
    let sets = again.list_golden_sets().await.unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].name, "persisted");

    let memory = open_store(&StoreConfig::default()).unwrap();
    assert!(memory.list_golden_sets().await.unwrap().is_empty());
}
