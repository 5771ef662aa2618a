//! Persistence for queries, evaluation records, golden sets and runs.
//!
//! Evaluation records are append-only: the [`EvaluationStore`] trait has no
//! method that updates or deletes one. Golden sets are versioned and every
//! mutation bumps their version. Runs are saved as whole snapshots.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RaglensError, Result, StoreError, ValidationError};
use crate::types::{
    EvaluationRecord, EvaluationRun, EvaluationType, GoldenSet, NewTestCase, QueryRecord, TestCase,
};

/// Listing filter for evaluation records. Results are newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationFilter {
    #[serde(default)]
    pub evaluation_type: Option<EvaluationType>,
    #[serde(default)]
    pub query_id: Option<Uuid>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

impl Default for EvaluationFilter {
    fn default() -> Self {
        Self {
            evaluation_type: None,
            query_id: None,
            skip: 0,
            limit: default_limit(),
        }
    }
}

impl EvaluationFilter {
    fn matches(&self, record: &EvaluationRecord) -> bool {
        self.evaluation_type.is_none_or(|t| record.evaluation_type == t)
            && self.query_id.is_none_or(|q| record.query_id == q)
    }
}

/// Partial edit of a golden set's metadata. Unset fields are left alone;
/// an empty description clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoldenSetUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl GoldenSetUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn save_query(&self, query: QueryRecord) -> Result<()>;
    async fn get_query(&self, id: Uuid) -> Result<Option<QueryRecord>>;

    async fn append_evaluation(&self, record: EvaluationRecord) -> Result<()>;
    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationRecord>>;
    async fn list_evaluations(&self, filter: &EvaluationFilter) -> Result<Vec<EvaluationRecord>>;
    /// Records with `from <= timestamp <= to`, oldest first.
    async fn evaluations_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EvaluationRecord>>;

    async fn create_golden_set(&self, name: &str, description: Option<String>) -> Result<GoldenSet>;
    async fn list_golden_sets(&self) -> Result<Vec<GoldenSet>>;
    async fn get_golden_set(&self, id: Uuid) -> Result<Option<GoldenSet>>;
    /// Rename or re-describe a set. Bumps its version when anything changes.
    async fn update_golden_set(&self, id: Uuid, update: GoldenSetUpdate) -> Result<GoldenSet>;
    async fn delete_golden_set(&self, id: Uuid) -> Result<()>;
    async fn add_test_cases(&self, set_id: Uuid, cases: Vec<NewTestCase>) -> Result<Vec<TestCase>>;
    async fn update_test_case(&self, set_id: Uuid, case_id: Uuid, case: NewTestCase) -> Result<TestCase>;
    async fn delete_test_case(&self, set_id: Uuid, case_id: Uuid) -> Result<()>;

    /// Insert or replace the stored snapshot of a run.
    async fn save_run(&self, run: &EvaluationRun) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Option<EvaluationRun>>;
    /// Runs for a golden set, newest first.
    async fn list_runs(&self, test_set_id: Uuid) -> Result<Vec<EvaluationRun>>;

    async fn add_test_case(&self, set_id: Uuid, case: NewTestCase) -> Result<TestCase> {
        let mut added = self.add_test_cases(set_id, vec![case]).await?;
        added.pop().ok_or_else(|| {
            StoreError::Backend {
                message: "test case insert returned nothing".into(),
            }
            .into()
        })
    }

    async fn require_query(&self, id: Uuid) -> Result<QueryRecord> {
        self.get_query(id)
            .await?
            .ok_or_else(|| ValidationError::not_found("Query", id).into())
    }

    async fn require_golden_set(&self, id: Uuid) -> Result<GoldenSet> {
        self.get_golden_set(id)
            .await?
            .ok_or_else(|| ValidationError::not_found("Golden set", id).into())
    }

    async fn require_run(&self, id: Uuid) -> Result<EvaluationRun> {
        self.get_run(id)
            .await?
            .ok_or_else(|| ValidationError::not_found("Evaluation run", id).into())
    }
}

fn validate_set_name(name: &str) -> std::result::Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::empty("name"));
    }
    Ok(())
}

fn duplicate_name(name: &str) -> RaglensError {
    StoreError::Conflict {
        message: format!("golden set '{name}' already exists"),
    }
    .into()
}

/// Apply `update` to `set`; `taken` reports whether another set already uses a name.
fn apply_set_update(
    set: &mut GoldenSet,
    update: GoldenSetUpdate,
    taken: impl Fn(&str) -> bool,
) -> Result<()> {
    let mut changed = false;
    if let Some(name) = update.name {
        validate_set_name(&name)?;
        if name != set.name {
            if taken(&name) {
                return Err(duplicate_name(&name));
            }
            set.name = name;
            changed = true;
        }
    }
    if let Some(description) = update.description {
        let description = Some(description).filter(|d| !d.trim().is_empty());
        if description != set.description {
            set.description = description;
            changed = true;
        }
    }
    if changed {
        set.touch();
    }
    Ok(())
}

/// Case mutations shared by every backend.
fn push_cases(set: &mut GoldenSet, cases: Vec<NewTestCase>) -> Result<Vec<TestCase>> {
    for case in &cases {
        case.validate()?;
    }
    let added: Vec<TestCase> = cases.into_iter().map(NewTestCase::into_test_case).collect();
    set.cases.extend(added.iter().cloned());
    set.touch();
    Ok(added)
}

fn replace_case(set: &mut GoldenSet, case_id: Uuid, case: NewTestCase) -> Result<TestCase> {
    case.validate()?;
    let slot = set
        .cases
        .iter_mut()
        .find(|c| c.id == case_id)
        .ok_or_else(|| ValidationError::not_found("Test case", case_id))?;
    *slot = TestCase {
        id: case_id,
        ..case.into_test_case()
    };
    let updated = slot.clone();
    set.touch();
    Ok(updated)
}

fn remove_case(set: &mut GoldenSet, case_id: Uuid) -> Result<()> {
    let before = set.cases.len();
    set.cases.retain(|c| c.id != case_id);
    if set.cases.len() == before {
        return Err(ValidationError::not_found("Test case", case_id).into());
    }
    set.touch();
    Ok(())
}

#[derive(Default)]
struct Arenas {
    queries: HashMap<Uuid, QueryRecord>,
    evaluations: Vec<EvaluationRecord>,
    golden_sets: Vec<GoldenSet>,
    runs: Vec<EvaluationRun>,
}

/// Process-local store. Evaluation records live in an append-only vector.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Arenas>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvaluationStore for InMemoryStore {
    async fn save_query(&self, query: QueryRecord) -> Result<()> {
        self.inner.write().await.queries.insert(query.id, query);
        Ok(())
    }

    async fn get_query(&self, id: Uuid) -> Result<Option<QueryRecord>> {
        Ok(self.inner.read().await.queries.get(&id).cloned())
    }

    async fn append_evaluation(&self, record: EvaluationRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.evaluations.iter().any(|r| r.id == record.id) {
            return Err(StoreError::Conflict {
                message: format!("evaluation {} already recorded", record.id),
            }
            .into());
        }
        inner.evaluations.push(record);
        Ok(())
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .evaluations
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_evaluations(&self, filter: &EvaluationFilter) -> Result<Vec<EvaluationRecord>> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&EvaluationRecord> =
            inner.evaluations.iter().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matching
            .into_iter()
            .skip(filter.skip)
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn evaluations_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EvaluationRecord>> {
        let inner = self.inner.read().await;
        let mut window: Vec<EvaluationRecord> = inner
            .evaluations
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect();
        window.sort_by_key(|r| r.timestamp);
        Ok(window)
    }

    async fn create_golden_set(&self, name: &str, description: Option<String>) -> Result<GoldenSet> {
        validate_set_name(name)?;
        let mut inner = self.inner.write().await;
        if inner.golden_sets.iter().any(|s| s.name == name) {
            return Err(duplicate_name(name));
        }
        let set = GoldenSet::new(name, description);
        inner.golden_sets.push(set.clone());
        Ok(set)
    }

    async fn list_golden_sets(&self) -> Result<Vec<GoldenSet>> {
        Ok(self.inner.read().await.golden_sets.clone())
    }

    async fn get_golden_set(&self, id: Uuid) -> Result<Option<GoldenSet>> {
        Ok(self
            .inner
            .read()
            .await
            .golden_sets
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn update_golden_set(&self, id: Uuid, update: GoldenSetUpdate) -> Result<GoldenSet> {
        let mut inner = self.inner.write().await;
        let others: Vec<String> = inner
            .golden_sets
            .iter()
            .filter(|s| s.id != id)
            .map(|s| s.name.clone())
            .collect();
        let set = inner
            .golden_sets
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ValidationError::not_found("Golden set", id))?;
        apply_set_update(set, update, |name| others.iter().any(|n| n == name))?;
        Ok(set.clone())
    }

    async fn delete_golden_set(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let before = inner.golden_sets.len();
        inner.golden_sets.retain(|s| s.id != id);
        if inner.golden_sets.len() == before {
            return Err(ValidationError::not_found("Golden set", id).into());
        }
        Ok(())
    }

    async fn add_test_cases(&self, set_id: Uuid, cases: Vec<NewTestCase>) -> Result<Vec<TestCase>> {
        let mut inner = self.inner.write().await;
        let set = inner
            .golden_sets
            .iter_mut()
            .find(|s| s.id == set_id)
            .ok_or_else(|| ValidationError::not_found("Golden set", set_id))?;
        push_cases(set, cases)
    }

    async fn update_test_case(&self, set_id: Uuid, case_id: Uuid, case: NewTestCase) -> Result<TestCase> {
        let mut inner = self.inner.write().await;
        let set = inner
            .golden_sets
            .iter_mut()
            .find(|s| s.id == set_id)
            .ok_or_else(|| ValidationError::not_found("Golden set", set_id))?;
        replace_case(set, case_id, case)
    }

    async fn delete_test_case(&self, set_id: Uuid, case_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let set = inner
            .golden_sets
            .iter_mut()
            .find(|s| s.id == set_id)
            .ok_or_else(|| ValidationError::not_found("Golden set", set_id))?;
        remove_case(set, case_id)
    }

    async fn save_run(&self, run: &EvaluationRun) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(pos) = inner.runs.iter().position(|r| r.id == run.id) {
            inner.runs[pos] = run.clone();
        } else {
            inner.runs.push(run.clone());
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<EvaluationRun>> {
        Ok(self.inner.read().await.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, test_set_id: Uuid) -> Result<Vec<EvaluationRun>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<EvaluationRun> = inner
            .runs
            .iter()
            .filter(|r| r.test_set_id == test_set_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queries (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS evaluations (
    id TEXT PRIMARY KEY,
    query_id TEXT NOT NULL,
    evaluation_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_evaluations_timestamp ON evaluations(timestamp);
CREATE INDEX IF NOT EXISTS idx_evaluations_query ON evaluations(query_id);
CREATE TABLE IF NOT EXISTS golden_sets (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    test_set_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_test_set ON runs(test_set_id);
";

/// Fixed-width timestamps so lexical order matches chronological order.
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        StoreError::Backend {
            message: format!("failed to encode row: {e}"),
        }
        .into()
    })
}

fn decode<T: serde::de::DeserializeOwned>(data: &str) -> std::result::Result<T, StoreError> {
    serde_json::from_str(data).map_err(|e| StoreError::Corrupt {
        message: e.to_string(),
    })
}

fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<String>) -> Result<Vec<T>> {
    rows.iter().map(|d| decode(d).map_err(RaglensError::from)).collect()
}

/// SQLite-backed store. Rows carry the full record as JSON next to the
/// columns used for filtering and ordering.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
                message: format!("failed to create {}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(path).map_err(StoreError::from)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::from)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(StoreError::from)?;
        debug!("SQLite evaluation store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            op(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend {
            message: format!("store task failed: {e}"),
        })?
    }

    async fn mutate_set<T, F>(&self, set_id: Uuid, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut GoldenSet) -> Result<T> + Send + 'static,
    {
        self.with_conn(move |conn| {
            let mut set = load_set(conn, set_id)?
                .ok_or_else(|| ValidationError::not_found("Golden set", set_id))?;
            let out = op(&mut set)?;
            conn.execute(
                "UPDATE golden_sets SET data = ?1 WHERE id = ?2",
                params![encode(&set)?, set_id.to_string()],
            )
            .map_err(StoreError::from)?;
            Ok(out)
        })
        .await
    }
}

fn load_set(conn: &Connection, id: Uuid) -> Result<Option<GoldenSet>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM golden_sets WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)?;
    Ok(data.map(|d| decode(&d)).transpose()?)
}

fn query_strings(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(StoreError::from)?;
    let rows = stmt
        .query_map(args, |row| row.get::<_, String>(0))
        .map_err(StoreError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::from)?;
    Ok(rows)
}

fn single_string(conn: &Connection, sql: &str, id: Uuid) -> Result<Option<String>> {
    Ok(conn
        .query_row(sql, params![id.to_string()], |row| row.get(0))
        .optional()
        .map_err(StoreError::from)?)
}

#[async_trait]
impl EvaluationStore for SqliteStore {
    async fn save_query(&self, query: QueryRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO queries (id, data) VALUES (?1, ?2)",
                params![query.id.to_string(), encode(&query)?],
            )
            .map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    async fn get_query(&self, id: Uuid) -> Result<Option<QueryRecord>> {
        self.with_conn(move |conn| {
            let data = single_string(conn, "SELECT data FROM queries WHERE id = ?1", id)?;
            Ok(data.map(|d| decode(&d)).transpose()?)
        })
        .await
    }

    async fn append_evaluation(&self, record: EvaluationRecord) -> Result<()> {
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO evaluations (id, query_id, evaluation_type, timestamp, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.id.to_string(),
                        record.query_id.to_string(),
                        record.evaluation_type.as_str(),
                        ts(record.timestamp),
                        encode(&record)?,
                    ],
                )
                .map_err(StoreError::from)?;
            if inserted == 0 {
                return Err(StoreError::Conflict {
                    message: format!("evaluation {} already recorded", record.id),
                }
                .into());
            }
            Ok(())
        })
        .await
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationRecord>> {
        self.with_conn(move |conn| {
            let data = single_string(conn, "SELECT data FROM evaluations WHERE id = ?1", id)?;
            Ok(data.map(|d| decode(&d)).transpose()?)
        })
        .await
    }

    async fn list_evaluations(&self, filter: &EvaluationFilter) -> Result<Vec<EvaluationRecord>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let evaluation_type = filter.evaluation_type.map(|t| t.as_str().to_string());
            let query_id = filter.query_id.map(|q| q.to_string());
            let rows = query_strings(
                conn,
                "SELECT data FROM evaluations
                 WHERE (?1 IS NULL OR evaluation_type = ?1)
                   AND (?2 IS NULL OR query_id = ?2)
                 ORDER BY timestamp DESC
                 LIMIT ?3 OFFSET ?4",
                &[
                    &evaluation_type,
                    &query_id,
                    &(filter.limit as i64),
                    &(filter.skip as i64),
                ],
            )?;
            decode_rows(rows)
        })
        .await
    }

    async fn evaluations_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EvaluationRecord>> {
        self.with_conn(move |conn| {
            let rows = query_strings(
                conn,
                "SELECT data FROM evaluations WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp ASC",
                &[&ts(from), &ts(to)],
            )?;
            decode_rows(rows)
        })
        .await
    }

    async fn create_golden_set(&self, name: &str, description: Option<String>) -> Result<GoldenSet> {
        validate_set_name(name)?;
        let set = GoldenSet::new(name, description);
        self.with_conn(move |conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM golden_sets WHERE name = ?1",
                    params![set.name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::from)?;
            if exists.is_some() {
                return Err(duplicate_name(&set.name));
            }
            conn.execute(
                "INSERT INTO golden_sets (id, name, created_at, data) VALUES (?1, ?2, ?3, ?4)",
                params![set.id.to_string(), set.name, ts(set.created_at), encode(&set)?],
            )
            .map_err(StoreError::from)?;
            Ok(set)
        })
        .await
    }

    async fn list_golden_sets(&self) -> Result<Vec<GoldenSet>> {
        self.with_conn(|conn| {
            let rows = query_strings(conn, "SELECT data FROM golden_sets ORDER BY created_at ASC", &[])?;
            decode_rows(rows)
        })
        .await
    }

    async fn get_golden_set(&self, id: Uuid) -> Result<Option<GoldenSet>> {
        self.with_conn(move |conn| load_set(conn, id)).await
    }

    async fn update_golden_set(&self, id: Uuid, update: GoldenSetUpdate) -> Result<GoldenSet> {
        self.with_conn(move |conn| {
            let mut set = load_set(conn, id)?.ok_or_else(|| ValidationError::not_found("Golden set", id))?;
            // A failed lookup counts as taken.
            apply_set_update(&mut set, update, |name| {
                conn.query_row(
                    "SELECT 1 FROM golden_sets WHERE name = ?1 AND id != ?2",
                    params![name, id.to_string()],
                    |_| Ok(()),
                )
                .optional()
                .map_or(true, |found| found.is_some())
            })?;
            conn.execute(
                "UPDATE golden_sets SET name = ?1, data = ?2 WHERE id = ?3",
                params![set.name, encode(&set)?, id.to_string()],
            )
            .map_err(StoreError::from)?;
            Ok(set)
        })
        .await
    }

    async fn delete_golden_set(&self, id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM golden_sets WHERE id = ?1", params![id.to_string()])
                .map_err(StoreError::from)?;
            if deleted == 0 {
                return Err(ValidationError::not_found("Golden set", id).into());
            }
            Ok(())
        })
        .await
    }

    async fn add_test_cases(&self, set_id: Uuid, cases: Vec<NewTestCase>) -> Result<Vec<TestCase>> {
        self.mutate_set(set_id, move |set| push_cases(set, cases)).await
    }

    async fn update_test_case(&self, set_id: Uuid, case_id: Uuid, case: NewTestCase) -> Result<TestCase> {
        self.mutate_set(set_id, move |set| replace_case(set, case_id, case))
            .await
    }

    async fn delete_test_case(&self, set_id: Uuid, case_id: Uuid) -> Result<()> {
        self.mutate_set(set_id, move |set| remove_case(set, case_id)).await
    }

    async fn save_run(&self, run: &EvaluationRun) -> Result<()> {
        let run = run.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO runs (id, test_set_id, started_at, data) VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.id.to_string(),
                    run.test_set_id.to_string(),
                    ts(run.started_at),
                    encode(&run)?,
                ],
            )
            .map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<EvaluationRun>> {
        self.with_conn(move |conn| {
            let data = single_string(conn, "SELECT data FROM runs WHERE id = ?1", id)?;
            Ok(data.map(|d| decode(&d)).transpose()?)
        })
        .await
    }

    async fn list_runs(&self, test_set_id: Uuid) -> Result<Vec<EvaluationRun>> {
        self.with_conn(move |conn| {
            let rows = query_strings(
                conn,
                "SELECT data FROM runs WHERE test_set_id = ?1 ORDER BY started_at DESC",
                &[&test_set_id.to_string()],
            )?;
            decode_rows(rows)
        })
        .await
    }
}

/// Open the backend selected in configuration.
pub fn open_store(config: &crate::config::StoreConfig) -> Result<Arc<dyn EvaluationStore>> {
    match config.backend {
        crate::config::StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        crate::config::StoreBackend::Sqlite => {
            let path = config.resolved_path();
            debug!(path = %path.display(), "Opening SQLite store");
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CriterionScores, EvaluationMetadata, EvaluationScores, EvaluatorIdentity};
    use chrono::Duration;

    fn record(query_id: Uuid, kind: EvaluationType, age_hours: i64) -> EvaluationRecord {
        let scores = EvaluationScores::from_criteria(CriterionScores {
            accuracy: 4,
            completeness: 4,
            faithfulness: 4,
            tone: 4,
            relevance: 4,
            clarity: 4,
        });
        EvaluationRecord::new(
            query_id,
            kind,
            scores,
            EvaluatorIdentity::new("mock", "mock-model"),
            EvaluationMetadata::default(),
        )
        .at(Utc::now() - Duration::hours(age_hours))
    }

    async fn exercise_store(store: &dyn EvaluationStore) {
        let query = QueryRecord::new("how do I cancel my order?");
        let query_id = query.id;
        store.save_query(query.clone()).await.unwrap();
        assert_eq!(store.get_query(query_id).await.unwrap(), Some(query));
        assert!(store.require_query(Uuid::new_v4()).await.is_err());

        let old = record(query_id, EvaluationType::LlmJudge, 48);
        let recent = record(query_id, EvaluationType::Retrieval, 1);
        store.append_evaluation(old.clone()).await.unwrap();
        store.append_evaluation(recent.clone()).await.unwrap();
        let dup = store.append_evaluation(old.clone()).await.unwrap_err();
        assert_eq!(dup.kind(), "store_error");

        let all = store.list_evaluations(&EvaluationFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![recent.id, old.id]);

        let judged = store
            .list_evaluations(&EvaluationFilter {
                evaluation_type: Some(EvaluationType::LlmJudge),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(judged.len(), 1);

        let paged = store
            .list_evaluations(&EvaluationFilter {
                skip: 1,
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged[0].id, old.id);

        let window = store
            .evaluations_between(Utc::now() - Duration::hours(24), Utc::now())
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].id, recent.id);
        assert_eq!(store.get_evaluation(old.id).await.unwrap(), Some(old));

        let set = store.create_golden_set("billing", None).await.unwrap();
        assert_eq!(set.version, 1);
        assert!(store.create_golden_set("billing", None).await.is_err());
        assert!(store.create_golden_set("  ", None).await.is_err());

        let cases = store
            .add_test_cases(
                set.id,
                vec![
                    NewTestCase::new("q1", "a1"),
                    NewTestCase::new("q2", "a2"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(cases.len(), 2);
        assert!(store.add_test_case(set.id, NewTestCase::new("", "a")).await.is_err());

        let updated = store
            .update_test_case(set.id, cases[0].id, NewTestCase::new("q1 edited", "a1"))
            .await
            .unwrap();
        assert_eq!(updated.id, cases[0].id);
        store.delete_test_case(set.id, cases[1].id).await.unwrap();

        let reloaded = store.require_golden_set(set.id).await.unwrap();
        assert_eq!(reloaded.version, 4);
        assert_eq!(reloaded.cases.len(), 1);
        assert_eq!(reloaded.cases[0].query, "q1 edited");

        let other = store.create_golden_set("shipping", None).await.unwrap();
        let renamed = store
            .update_golden_set(
                set.id,
                GoldenSetUpdate {
                    name: Some("billing v2".into()),
                    description: Some("Invoices and refunds".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "billing v2");
        assert_eq!(renamed.description.as_deref(), Some("Invoices and refunds"));
        assert_eq!(renamed.version, 5);
        assert_eq!(renamed.cases.len(), 1);
        let clash = store
            .update_golden_set(
                set.id,
                GoldenSetUpdate {
                    name: Some("shipping".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(clash.kind(), "store_error");
        let unchanged = store
            .update_golden_set(set.id, GoldenSetUpdate::default())
            .await
            .unwrap();
        assert_eq!(unchanged.version, 5);
        assert!(store.create_golden_set("billing", None).await.is_ok());
        assert!(store.create_golden_set("billing v2", None).await.is_err());
        assert!(
            store
                .update_golden_set(Uuid::new_v4(), GoldenSetUpdate::default())
                .await
                .is_err()
        );
        store.delete_golden_set(other.id).await.unwrap();

        store.delete_golden_set(set.id).await.unwrap();
        assert!(store.get_golden_set(set.id).await.unwrap().is_none());
        assert!(store.delete_golden_set(set.id).await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise_store(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_in_memory() {
        exercise_store(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_runs_listed_newest_first() {
        use crate::types::RunConfigSnapshot;
        let store = InMemoryStore::new();
        let set_id = Uuid::new_v4();
        let snapshot = RunConfigSnapshot {
            llm_provider: "openai".into(),
            evaluator_provider: "anthropic".into(),
            top_k: 5,
            run_name: None,
            pass_threshold: 0.7,
        };
        let mut first = EvaluationRun::new(set_id, snapshot.clone());
        first.started_at = Utc::now() - Duration::minutes(5);
        let second = EvaluationRun::new(set_id, snapshot);
        store.save_run(&first).await.unwrap();
        store.save_run(&second).await.unwrap();

        first.transition(crate::types::RunStatus::Running).unwrap();
        store.save_run(&first).await.unwrap();

        let runs = store.list_runs(set_id).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[1].status, crate::types::RunStatus::Running);
        assert!(store.list_runs(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
