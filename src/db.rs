use async_trait::async_trait;
use rusqlite::{params, Connection, DatabaseName, ErrorCode, OptionalExtension};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::task;

use crate::config::StoreConfig;
use crate::models::{CanonicalRecord, EventKind, NaturalKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("store connection is closed")]
    Closed,

    #[error("cannot serialize document: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => StoreError::Rejected(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Append/query document service keyed by natural key.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates the collection and its schema checks if missing.
    async fn prepare(&self) -> Result<(), StoreError>;

    /// Inserts the record unless its natural key is already stored.
    async fn upsert(&self, record: &CanonicalRecord) -> Result<UpsertOutcome, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Document store over SQLite: one JSON document per row, attached under
/// the configured database name.
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
    database: String,
    collection: String,
}

impl SqliteStore {
    /// Opens `uri` (a path, `:memory:`, or `sqlite://path`) as schema `database`.
    /// Names must already be validated identifiers.
    pub fn connect(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let path = cfg.uri.strip_prefix("sqlite://").unwrap_or(&cfg.uri);
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute("ATTACH DATABASE ?1 AS ?2", params![path, cfg.database])?;
        conn.pragma_update(Some(DatabaseName::Attached(&cfg.database)), "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            database: cfg.database.clone(),
            collection: cfg.collection.clone(),
        })
    }

    fn table(&self) -> String {
        format!("\"{}\".\"{}\"", self.database, self.collection)
    }

    fn schema_sql(&self) -> String {
        let kinds = EventKind::ALL
            .iter()
            .map(|k| format!("'{k}'"))
            .collect::<Vec<_>>()
            .join(",");
        let required = EventKind::ALL
            .iter()
            .map(|k| {
                let checks = k
                    .required_fields()
                    .iter()
                    .map(|f| format!("coalesce(json_extract(document, '$.{f}'), '') <> ''"))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!("WHEN '{k}' THEN {checks}")
            })
            .collect::<Vec<_>>()
            .join("\n        ");

        format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
  natural_key TEXT PRIMARY KEY,
  kind        TEXT NOT NULL CHECK (kind IN ({kinds})),
  document    TEXT NOT NULL CHECK (json_valid(document)),
  observed_at TEXT NOT NULL,
  stored_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
  CHECK (json_extract(document, '$.kind') = kind),
  CHECK (CASE kind
        {required}
        ELSE 0 END)
);

CREATE INDEX IF NOT EXISTS "{db}"."{coll}_kind" ON "{coll}" (kind);
"#,
            table = self.table(),
            db = self.database,
            coll = self.collection,
        )
    }

    /// Runs `f` against the live connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = self.table();
        task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            f(conn, &table)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    /// Stored document for `key`, if any.
    pub async fn find(&self, key: &NaturalKey) -> Result<Option<serde_json::Value>, StoreError> {
        let key = key.as_str().to_string();
        self.with_conn(move |conn, table| {
            let doc: Option<String> = conn
                .query_row(
                    &format!("SELECT document FROM {table} WHERE natural_key = ?1"),
                    [key],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(doc.map(|d| serde_json::from_str(&d)).transpose()?)
        })
        .await
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn, table| {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
            Ok(n as u64)
        })
        .await
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn prepare(&self) -> Result<(), StoreError> {
        let sql = self.schema_sql();
        self.with_conn(move |conn, _| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<UpsertOutcome, StoreError> {
        let key = record.natural_key.as_str().to_string();
        let kind = record.kind().as_str();
        let observed_at = record.observed_at.clone();
        let document = serde_json::to_string(record)?;
        self.with_conn(move |conn, table| {
            // first write wins; a redelivered log leaves the stored copy untouched
            let changed = conn.execute(
                &format!(
                    "INSERT INTO {table} (natural_key, kind, document, observed_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(natural_key) DO NOTHING"
                ),
                params![key, kind, document, observed_at],
            )?;
            Ok(if changed == 1 {
                UpsertOutcome::Inserted
            } else {
                UpsertOutcome::AlreadyPresent
            })
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            match guard.take() {
                Some(conn) => conn.close().map_err(|(_, e)| StoreError::from(e)),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}
