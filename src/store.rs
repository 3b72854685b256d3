//! Embedded relational store: one SQLite file, WAL journaling, a single
//! writer serialized by `tokio_rusqlite::Connection`'s internal worker
//! thread.
//!
//! Grounded on the `rusqlite`+`tokio-rusqlite` pairing used for embedded
//! storage in the broader example pack (the teacher itself has no
//! persistence layer — Prometheus scraping was its only durable surface).

use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;
use tracing::info;

use crate::error::EngineError;
use crate::model::{
    Collection, ConfigEntry, Environment, Globals, MetricSnapshot, RequestDef, ResultRecord, Run,
    RunStatus, RunType,
};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    parent_id TEXT,
    name TEXT NOT NULL,
    ord INTEGER NOT NULL DEFAULT 0,
    variables TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    collection_id TEXT NOT NULL,
    name TEXT NOT NULL,
    definition TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS environments (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    variables TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS globals (
    id TEXT PRIMARY KEY,
    variables TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS config_entries (
    key TEXT PRIMARY KEY,
    entry TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    run_type TEXT NOT NULL,
    status TEXT NOT NULL,
    request_id TEXT,
    environment_id TEXT,
    config_snapshot TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER
);

CREATE TABLE IF NOT EXISTS results (
    run_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    status_code INTEGER NOT NULL,
    latency_ms REAL NOT NULL,
    error TEXT NOT NULL DEFAULT '',
    trace_data TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_results_run_ts ON results(run_id, timestamp);

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    name TEXT NOT NULL,
    value REAL NOT NULL,
    labels TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_metrics_run_id ON metrics(run_id, id);

CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub struct Store {
    conn: Connection,
}

fn db_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::DatabaseError(e.to_string())
}

impl Store {
    pub async fn open(path: &str) -> Result<Self, EngineError> {
        let conn = Connection::open(path).await.map_err(db_err)?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(db_err)?;
        info!(path, "store opened");
        Ok(Self { conn })
    }

    pub async fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().await.map_err(db_err)?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(db_err)?;
        Ok(Self { conn })
    }

    // --- Collections --------------------------------------------------

    pub async fn save_collection(&self, c: Collection) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                let variables = serde_json::to_string(&c.variables).unwrap_or_default();
                conn.execute(
                    "INSERT INTO collections (id, parent_id, name, ord, variables, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        parent_id=excluded.parent_id, name=excluded.name, ord=excluded.ord,
                        variables=excluded.variables, updated_at=excluded.updated_at",
                    params![c.id, c.parent_id, c.name, c.order, variables, c.created_at, c.updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    pub async fn list_collections(&self) -> Result<Vec<Collection>, EngineError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, parent_id, name, ord, variables, created_at, updated_at FROM collections ORDER BY ord")?;
                let rows = stmt
                    .query_map([], |row| {
                        let variables_raw: String = row.get(4)?;
                        Ok(Collection {
                            id: row.get(0)?,
                            parent_id: row.get(1)?,
                            name: row.get(2)?,
                            order: row.get(3)?,
                            variables: serde_json::from_str(&variables_raw).unwrap_or_default(),
                            created_at: row.get(5)?,
                            updated_at: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_err)
    }

    /// Deletes a collection and its subtree, plus any requests owned by
    /// that subtree. O(depth) recursive CTE, not a full scan.
    pub async fn delete_collection(&self, id: String) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "WITH RECURSIVE subtree(id) AS (
                        SELECT ?1
                        UNION ALL
                        SELECT c.id FROM collections c JOIN subtree s ON c.parent_id = s.id
                     )
                     DELETE FROM requests WHERE collection_id IN (SELECT id FROM subtree)",
                    params![id],
                )?;
                tx.execute(
                    "WITH RECURSIVE subtree(id) AS (
                        SELECT ?1
                        UNION ALL
                        SELECT c.id FROM collections c JOIN subtree s ON c.parent_id = s.id
                     )
                     DELETE FROM collections WHERE id IN (SELECT id FROM subtree)",
                    params![id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    // --- Requests -------------------------------------------------------

    pub async fn save_request(&self, r: RequestDef) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                let definition = serde_json::to_string(&r).unwrap_or_default();
                conn.execute(
                    "INSERT INTO requests (id, collection_id, name, definition, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        collection_id=excluded.collection_id, name=excluded.name,
                        definition=excluded.definition, updated_at=excluded.updated_at",
                    params![r.id, r.collection_id, r.name, definition, r.created_at, r.updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    /// Lists requests, optionally filtered to one collection. The
    /// definition column is the JSON-serialized source of truth; `name`/
    /// `collection_id` are denormalized columns purely for this filter.
    pub async fn list_requests(&self, collection_id: Option<String>) -> Result<Vec<RequestDef>, EngineError> {
        self.conn
            .call(move |conn| {
                let mut stmt = match &collection_id {
                    Some(_) => conn.prepare("SELECT definition FROM requests WHERE collection_id = ?1")?,
                    None => conn.prepare("SELECT definition FROM requests")?,
                };
                let rows = if let Some(cid) = &collection_id {
                    stmt.query_map(params![cid], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?
                } else {
                    stmt.query_map([], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };
                Ok(rows
                    .into_iter()
                    .filter_map(|raw| serde_json::from_str(&raw).ok())
                    .collect())
            })
            .await
            .map_err(db_err)
    }

    pub async fn get_request(&self, id: String) -> Result<Option<RequestDef>, EngineError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT definition FROM requests WHERE id = ?1",
                        params![id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()
                    .map(|opt| opt.and_then(|raw| serde_json::from_str(&raw).ok()))?)
            })
            .await
            .map_err(db_err)
    }

    pub async fn delete_request(&self, id: String) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM requests WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    // --- Environments / Globals ----------------------------------------

    pub async fn save_environment(&self, e: Environment) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                let variables = serde_json::to_string(&e.variables).unwrap_or_default();
                conn.execute(
                    "INSERT INTO environments (id, name, variables, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET name=excluded.name, variables=excluded.variables, updated_at=excluded.updated_at",
                    params![e.id, e.name, variables, e.updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    pub async fn list_environments(&self) -> Result<Vec<Environment>, EngineError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, name, variables, updated_at FROM environments")?;
                let rows = stmt
                    .query_map([], |row| {
                        let variables_raw: String = row.get(2)?;
                        Ok(Environment {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            variables: serde_json::from_str(&variables_raw).unwrap_or_default(),
                            updated_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_err)
    }

    pub async fn delete_environment(&self, id: String) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM environments WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    pub async fn get_globals(&self) -> Result<Globals, EngineError> {
        self.conn
            .call(|conn| {
                let found = conn
                    .query_row(
                        "SELECT id, variables, updated_at FROM globals WHERE id = ?1",
                        params![Globals::ID],
                        |row| {
                            let variables_raw: String = row.get(1)?;
                            Ok(Globals {
                                id: row.get(0)?,
                                variables: serde_json::from_str(&variables_raw).unwrap_or_default(),
                                updated_at: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(found.unwrap_or_else(|| Globals::empty(0)))
            })
            .await
            .map_err(db_err)
    }

    pub async fn save_globals(&self, g: Globals) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                let variables = serde_json::to_string(&g.variables).unwrap_or_default();
                conn.execute(
                    "INSERT INTO globals (id, variables, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET variables=excluded.variables, updated_at=excluded.updated_at",
                    params![g.id, variables, g.updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    // --- Runs ------------------------------------------------------------

    pub async fn create_run(&self, run: Run) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO runs (id, run_type, status, request_id, environment_id, config_snapshot, start_time, end_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        run.id,
                        run_type_label(run.run_type),
                        run_status_label(run.status),
                        run.request_id,
                        run.environment_id,
                        run.config_snapshot,
                        run.start_time,
                        run.end_time,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    /// Retries on `SQLITE_BUSY` with exponential backoff up to ~1 s, per
    /// the single-writer contention policy.
    pub async fn update_run_status_with_retry(&self, run_id: String, status: RunStatus, end_time: Option<i64>) -> Result<(), EngineError> {
        let mut delay_ms: u64 = 10;
        let mut attempts = 0;
        loop {
            let run_id = run_id.clone();
            let result = self
                .conn
                .call(move |conn| {
                    conn.execute(
                        "UPDATE runs SET status = ?1, end_time = COALESCE(?2, end_time) WHERE id = ?3",
                        params![run_status_label(status), end_time, run_id],
                    )?;
                    Ok(())
                })
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempts < 6 => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(1000);
                    let _ = e;
                }
                Err(e) => return Err(db_err(e)),
            }
        }
    }

    pub async fn get_run(&self, run_id: String) -> Result<Option<Run>, EngineError> {
        self.conn
            .call(move |conn| {
                let found = conn
                    .query_row(
                        "SELECT id, run_type, status, request_id, environment_id, config_snapshot, start_time, end_time FROM runs WHERE id = ?1",
                        params![run_id],
                        row_to_run,
                    )
                    .optional()?;
                Ok(found)
            })
            .await
            .map_err(db_err)
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>, EngineError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, run_type, status, request_id, environment_id, config_snapshot, start_time, end_time FROM runs ORDER BY start_time DESC",
                )?;
                let rows = stmt.query_map([], row_to_run)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_err)
    }

    pub async fn delete_run(&self, run_id: String) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM results WHERE run_id = ?1", params![run_id])?;
                tx.execute("DELETE FROM metrics WHERE run_id = ?1", params![run_id])?;
                tx.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    // --- Results -----------------------------------------------------

    pub async fn add_result(&self, r: ResultRecord) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO results (run_id, timestamp, status_code, latency_ms, error, trace_data) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![r.run_id, r.timestamp, r.status_code, r.latency_ms, r.error, r.trace_data],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    pub async fn batch_insert_results(&self, results: Vec<ResultRecord>) -> Result<(), EngineError> {
        if results.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO results (run_id, timestamp, status_code, latency_ms, error, trace_data) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for r in &results {
                        stmt.execute(params![r.run_id, r.timestamp, r.status_code, r.latency_ms, r.error, r.trace_data])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    pub async fn sample_results(&self, run_id: String, limit: i64) -> Result<Vec<ResultRecord>, EngineError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_id, timestamp, status_code, latency_ms, error, trace_data FROM results WHERE run_id = ?1 ORDER BY timestamp LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![run_id, limit], |row| {
                        Ok(ResultRecord {
                            run_id: row.get(0)?,
                            timestamp: row.get(1)?,
                            status_code: row.get(2)?,
                            latency_ms: row.get(3)?,
                            error: row.get(4)?,
                            trace_data: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_err)
    }

    // --- Metrics -------------------------------------------------------

    pub async fn insert_metric(&self, m: MetricSnapshot) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                let name = serde_json::to_string(&m.name).unwrap_or_default();
                conn.execute(
                    "INSERT INTO metrics (run_id, timestamp, name, value, labels) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![m.run_id, m.timestamp, name, m.value, m.labels],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    pub async fn insert_metrics_batch(&self, snapshots: Vec<MetricSnapshot>) -> Result<(), EngineError> {
        if snapshots.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO metrics (run_id, timestamp, name, value, labels) VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for m in &snapshots {
                        let name = serde_json::to_string(&m.name).unwrap_or_default();
                        stmt.execute(params![m.run_id, m.timestamp, name, m.value, m.labels])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    pub async fn get_metrics_since(&self, run_id: String, last_id: i64) -> Result<Vec<MetricSnapshot>, EngineError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, run_id, timestamp, name, value, labels FROM metrics WHERE run_id = ?1 AND id > ?2 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![run_id, last_id], row_to_metric)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_err)
    }

    pub async fn get_metrics_paginated(&self, run_id: String, limit: i64, offset: i64) -> Result<Vec<MetricSnapshot>, EngineError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, run_id, timestamp, name, value, labels FROM metrics WHERE run_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![run_id, limit, offset], row_to_metric)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_err)
    }

    pub async fn count_metrics(&self, run_id: String) -> Result<i64, EngineError> {
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM metrics WHERE run_id = ?1", params![run_id], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(db_err)
    }

    // --- Config ----------------------------------------------------------

    pub async fn list_config(&self) -> Result<Vec<ConfigEntry>, EngineError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT entry FROM config_entries ORDER BY key")?;
                let rows = stmt
                    .query_map([], |row| {
                        let raw: String = row.get(0)?;
                        Ok(raw)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().filter_map(|raw| serde_json::from_str(&raw).ok()).collect())
            })
            .await
            .map_err(db_err)
    }

    pub async fn save_config_entry(&self, entry: ConfigEntry) -> Result<(), EngineError> {
        self.conn
            .call(move |conn| {
                let raw = serde_json::to_string(&entry).unwrap_or_default();
                conn.execute(
                    "INSERT INTO config_entries (key, entry) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET entry = excluded.entry",
                    params![entry.key, raw],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }
}

fn run_type_label(t: RunType) -> &'static str {
    match t {
        RunType::Design => "design",
        RunType::Load => "load",
    }
}

fn run_status_label(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Stopped => "stopped",
        RunStatus::Failed => "failed",
    }
}

fn parse_run_type(s: &str) -> RunType {
    match s {
        "load" => RunType::Load,
        _ => RunType::Design,
    }
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "stopped" => RunStatus::Stopped,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Pending,
    }
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let run_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(Run {
        id: row.get(0)?,
        run_type: parse_run_type(&run_type),
        status: parse_run_status(&status),
        request_id: row.get(3)?,
        environment_id: row.get(4)?,
        config_snapshot: row.get(5)?,
        start_time: row.get(6)?,
        end_time: row.get(7)?,
    })
}

fn row_to_metric(row: &rusqlite::Row) -> rusqlite::Result<MetricSnapshot> {
    let name_raw: String = row.get(3)?;
    Ok(MetricSnapshot {
        id: row.get(0)?,
        run_id: row.get(1)?,
        timestamp: row.get(2)?,
        name: serde_json::from_str(&name_raw).unwrap_or(crate::model::MetricName::Completed),
        value: row.get(4)?,
        labels: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{generate_id, now_ms, MetricName};

    #[tokio::test]
    async fn file_backed_store_persists_schema_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.db");
        let path_str = path.to_str().unwrap();

        let collection = Collection {
            id: generate_id("col"),
            parent_id: None,
            name: "disk-backed".to_string(),
            order: 0,
            variables: Default::default(),
            created_at: now_ms(),
            updated_at: now_ms(),
        };
        {
            let store = Store::open(path_str).await.unwrap();
            store.save_collection(collection.clone()).await.unwrap();
        }

        let reopened = Store::open(path_str).await.unwrap();
        let collections = reopened.list_collections().await.unwrap();
        let found = collections.into_iter().find(|c| c.id == collection.id).unwrap();
        assert_eq!(found.name, "disk-backed");
    }

    #[tokio::test]
    async fn run_lifecycle_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let run = Run {
            id: generate_id("run"),
            run_type: RunType::Load,
            status: RunStatus::Pending,
            request_id: None,
            environment_id: None,
            config_snapshot: "{}".into(),
            start_time: now_ms(),
            end_time: None,
        };
        store.create_run(run.clone()).await.unwrap();
        let fetched = store.get_run(run.id.clone()).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Pending);

        store.update_run_status_with_retry(run.id.clone(), RunStatus::Completed, Some(now_ms())).await.unwrap();
        let fetched = store.get_run(run.id.clone()).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
        assert!(fetched.end_time.is_some());
    }

    #[tokio::test]
    async fn delete_run_cascades_results_and_metrics() {
        let store = Store::open_in_memory().await.unwrap();
        let run_id = generate_id("run");
        store
            .create_run(Run {
                id: run_id.clone(),
                run_type: RunType::Load,
                status: RunStatus::Running,
                request_id: None,
                environment_id: None,
                config_snapshot: "{}".into(),
                start_time: now_ms(),
                end_time: None,
            })
            .await
            .unwrap();
        store
            .add_result(ResultRecord { run_id: run_id.clone(), timestamp: now_ms(), status_code: 200, latency_ms: 5.0, error: String::new(), trace_data: String::new() })
            .await
            .unwrap();
        store
            .insert_metric(MetricSnapshot { id: None, run_id: run_id.clone(), timestamp: now_ms(), name: MetricName::Rps, value: 10.0, labels: String::new() })
            .await
            .unwrap();

        store.delete_run(run_id.clone()).await.unwrap();
        assert!(store.get_run(run_id.clone()).await.unwrap().is_none());
        assert_eq!(store.count_metrics(run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn metrics_id_is_monotonic_per_run() {
        let store = Store::open_in_memory().await.unwrap();
        let run_id = generate_id("run");
        for i in 0..3 {
            store
                .insert_metric(MetricSnapshot { id: None, run_id: run_id.clone(), timestamp: now_ms(), name: MetricName::Rps, value: i as f64, labels: String::new() })
                .await
                .unwrap();
        }
        let snapshots = store.get_metrics_since(run_id, 0).await.unwrap();
        assert_eq!(snapshots.len(), 3);
        assert!(snapshots[0].id.unwrap() < snapshots[1].id.unwrap());
        assert!(snapshots[1].id.unwrap() < snapshots[2].id.unwrap());
    }

    #[tokio::test]
    async fn collection_delete_cascades_subtree() {
        let store = Store::open_in_memory().await.unwrap();
        let root = Collection { id: "c_root".into(), parent_id: None, name: "root".into(), order: 0, variables: Default::default(), created_at: 0, updated_at: 0 };
        let child = Collection { id: "c_child".into(), parent_id: Some("c_root".into()), name: "child".into(), order: 0, variables: Default::default(), created_at: 0, updated_at: 0 };
        store.save_collection(root).await.unwrap();
        store.save_collection(child).await.unwrap();
        store.delete_collection("c_root".into()).await.unwrap();
        let remaining = store.list_collections().await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn request_crud_round_trips_and_filters_by_collection() {
        let store = Store::open_in_memory().await.unwrap();
        let req = crate::model::RequestDef {
            id: generate_id("req"),
            collection_id: "c_root".into(),
            name: "ping".into(),
            method: crate::model::HttpMethod::Get,
            url: "http://example.com".into(),
            headers: Default::default(),
            params: Default::default(),
            body: Default::default(),
            auth: None,
            pre_script: None,
            post_script: None,
            created_at: now_ms(),
            updated_at: now_ms(),
        };
        store.save_request(req.clone()).await.unwrap();
        let fetched = store.get_request(req.id.clone()).await.unwrap().unwrap();
        assert_eq!(fetched.name, "ping");

        let filtered = store.list_requests(Some("c_root".into())).await.unwrap();
        assert_eq!(filtered.len(), 1);
        let other = store.list_requests(Some("other".into())).await.unwrap();
        assert!(other.is_empty());

        store.delete_request(req.id.clone()).await.unwrap();
        assert!(store.get_request(req.id).await.unwrap().is_none());
    }
}
