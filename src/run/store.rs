//! Persistence for run and document results.
//!
//! The coordinator saves each document as soon as its pipeline is terminal
//! and the run once at the end. Store errors are logged by the caller and
//! never change a run's outcome.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::timeline::now_epoch_ms;
use super::types::{DocumentResult, RunResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_document(&self, run_id: Uuid, document: &DocumentResult)
        -> Result<(), StoreError>;
    async fn save_run(&self, run: &RunResult) -> Result<(), StoreError>;
}

// =============================================================================
// JSON directory
// =============================================================================

/// Writes `<root>/<run_id>/<document_id>.json` and `<root>/<run_id>/_run.json`.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn document_path(&self, run_id: Uuid, document_id: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("{}.json", sanitize_file_stem(document_id)))
    }

    async fn write_json<T: Serialize>(path: PathBuf, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for JsonDirStore {
    async fn save_document(
        &self,
        run_id: Uuid,
        document: &DocumentResult,
    ) -> Result<(), StoreError> {
        Self::write_json(self.document_path(run_id, &document.document_id), document).await
    }

    async fn save_run(&self, run: &RunResult) -> Result<(), StoreError> {
        Self::write_json(self.run_dir(run.run_id).join("_run.json"), run).await
    }
}

/// Keep ids readable as file names while blocking path traversal.
fn sanitize_file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.starts_with('.') {
        format!("_{stem}")
    } else {
        stem
    }
}

// =============================================================================
// SQLite
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StoredRun {
    pub run_id: String,
    pub status: String,
    pub document_count: i64,
    pub total_cost_nanodollars: i64,
    pub wall_duration_ms: i64,
    pub started_at: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub document_id: String,
    pub document_name: String,
    pub status: String,
    pub winner_id: Option<String>,
    pub variant_count: i64,
    pub cost_nanodollars: i64,
    pub duration_ms: i64,
    pub error_count: i64,
}

#[derive(Clone)]
pub struct SqliteRunStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;\
             CREATE TABLE IF NOT EXISTS runs (\
               run_id TEXT PRIMARY KEY,\
               status TEXT NOT NULL,\
               document_count INTEGER NOT NULL,\
               total_cost_nanodollars INTEGER NOT NULL,\
               wall_duration_ms INTEGER NOT NULL,\
               started_at TEXT NOT NULL,\
               result_json TEXT NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS documents (\
               run_id TEXT NOT NULL,\
               document_id TEXT NOT NULL,\
               document_name TEXT NOT NULL,\
               status TEXT NOT NULL,\
               winner_id TEXT,\
               variant_count INTEGER NOT NULL,\
               cost_nanodollars INTEGER NOT NULL,\
               duration_ms INTEGER NOT NULL,\
               error_count INTEGER NOT NULL,\
               result_json TEXT NOT NULL,\
               updated_at INTEGER NOT NULL,\
               PRIMARY KEY (run_id, document_id)\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("REFINERY_STORE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".refinery_runs.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Most recent runs first.
    pub async fn list_runs(&self) -> Result<Vec<StoredRun>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, status, document_count, total_cost_nanodollars, \
                 wall_duration_ms, started_at, updated_at \
                 FROM runs ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredRun {
                    run_id: row.get(0)?,
                    status: row.get(1)?,
                    document_count: row.get(2)?,
                    total_cost_nanodollars: row.get(3)?,
                    wall_duration_ms: row.get(4)?,
                    started_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?;
            let out = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    /// Documents saved for a run, including ones saved before the run finished.
    pub async fn list_documents(&self, run_id: Uuid) -> Result<Vec<StoredDocument>, StoreError> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT document_id, document_name, status, winner_id, variant_count, \
                 cost_nanodollars, duration_ms, error_count \
                 FROM documents WHERE run_id = ?1 ORDER BY document_id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok(StoredDocument {
                    document_id: row.get(0)?,
                    document_name: row.get(1)?,
                    status: row.get(2)?,
                    winner_id: row.get(3)?,
                    variant_count: row.get(4)?,
                    cost_nanodollars: row.get(5)?,
                    duration_ms: row.get(6)?,
                    error_count: row.get(7)?,
                })
            })?;
            let out = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    pub async fn load_run(&self, run_id: Uuid) -> Result<Option<RunResult>, StoreError> {
        let run_id = run_id.to_string();
        let raw: Option<String> = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT result_json FROM runs WHERE run_id = ?1",
                        params![run_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn save_document(
        &self,
        run_id: Uuid,
        document: &DocumentResult,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(document)?;
        let run_id = run_id.to_string();
        let document_id = document.document_id.clone();
        let document_name = document.document_name.clone();
        let status = document.status.as_str();
        let winner_id = document.winner_id.clone();
        let variant_count = document.variants.len() as i64;
        let cost = document.cost_nanodollars;
        let duration_ms = document.duration_ms as i64;
        let error_count = document.errors.len() as i64;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO documents (\
                    run_id, document_id, document_name, status, winner_id, variant_count,\
                    cost_nanodollars, duration_ms, error_count, result_json, updated_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)\
                 ON CONFLICT(run_id, document_id) DO UPDATE SET \
                    document_name = excluded.document_name,\
                    status = excluded.status,\
                    winner_id = excluded.winner_id,\
                    variant_count = excluded.variant_count,\
                    cost_nanodollars = excluded.cost_nanodollars,\
                    duration_ms = excluded.duration_ms,\
                    error_count = excluded.error_count,\
                    result_json = excluded.result_json,\
                    updated_at = excluded.updated_at",
                params![
                    run_id,
                    document_id,
                    document_name,
                    status,
                    winner_id,
                    variant_count,
                    cost,
                    duration_ms,
                    error_count,
                    json,
                    now_epoch_ms(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_run(&self, run: &RunResult) -> Result<(), StoreError> {
        let json = serde_json::to_string(run)?;
        let run_id = run.run_id.to_string();
        let status = run.status.as_str();
        let document_count = run.documents.len() as i64;
        let cost = run.total_cost_nanodollars;
        let wall_ms = run.wall_duration_ms as i64;
        let started_at = run.started_at.to_rfc3339();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO runs (\
                    run_id, status, document_count, total_cost_nanodollars,\
                    wall_duration_ms, started_at, result_json, updated_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)\
                 ON CONFLICT(run_id) DO UPDATE SET \
                    status = excluded.status,\
                    document_count = excluded.document_count,\
                    total_cost_nanodollars = excluded.total_cost_nanodollars,\
                    wall_duration_ms = excluded.wall_duration_ms,\
                    result_json = excluded.result_json,\
                    updated_at = excluded.updated_at",
                params![
                    run_id,
                    status,
                    document_count,
                    cost,
                    wall_ms,
                    started_at,
                    json,
                    now_epoch_ms(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_document_ids_for_file_names() {
        assert_eq!(sanitize_file_stem("intro-01"), "intro-01");
        assert_eq!(sanitize_file_stem("../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_stem("a b/c"), "a_b_c");
        assert_eq!(sanitize_file_stem(""), "_");
    }
}
