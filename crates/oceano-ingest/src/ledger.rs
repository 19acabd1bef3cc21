//! Durable per-file ingestion state in SQLite.
//!
//! One row per source path. Writes are batched; every batch is a single
//! transaction so a crash never leaves half a batch visible.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS files (
    path     TEXT PRIMARY KEY,
    mtime    REAL NOT NULL,
    status   TEXT NOT NULL,
    point_id TEXT,
    error    TEXT
);
CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);
";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("cannot create ledger directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt ledger row for {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Embedded, waiting for the index upsert to be confirmed.
    Pending,
    Done,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub path: String,
    /// Modification time in seconds since the epoch.
    pub mtime: f64,
    pub status: Status,
    pub point_id: Option<Uuid>,
    pub error: Option<String>,
}

impl LedgerEntry {
    pub fn pending(path: impl Into<String>, mtime: f64, point_id: Uuid) -> Self {
        Self {
            path: path.into(),
            mtime,
            status: Status::Pending,
            point_id: Some(point_id),
            error: None,
        }
    }

    pub fn failed(path: impl Into<String>, mtime: f64, cause: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mtime,
            status: Status::Error,
            point_id: None,
            error: Some(cause.into()),
        }
    }

    /// Already ingested and unchanged on disk since.
    pub fn is_current(&self, mtime: f64) -> bool {
        self.status == Status::Done && self.mtime == mtime
    }
}

/// Row counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub pending: u64,
    pub done: u64,
    pub error: u64,
}

impl LedgerCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.done + self.error
    }
}

type RawRow = (String, f64, String, Option<String>, Option<String>);

/// The ingestion ledger.
#[derive(Clone)]
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (creating if needed) the ledger database at `path`.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path).await?;
        let ledger = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "ledger opened");
        Ok(ledger)
    }

    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn get(&self, path: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let key = path.to_string();
        let row: Option<RawRow> = self
            .conn
            .call(move |conn| {
                let row = conn
                    .prepare_cached("SELECT path, mtime, status, point_id, error FROM files WHERE path = ?1")?
                    .query_row(params![key], |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                    })
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(decode_row).transpose()
    }

    /// Look up many paths in one round trip. Missing paths are absent from
    /// the result.
    pub async fn get_many(&self, paths: Vec<String>) -> Result<HashMap<String, LedgerEntry>, LedgerError> {
        let rows: Vec<RawRow> = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT path, mtime, status, point_id, error FROM files WHERE path = ?1")?;
                let mut rows = Vec::new();
                for path in &paths {
                    let row = stmt
                        .query_row(params![path], |r| {
                            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                        })
                        .optional()?;
                    rows.extend(row);
                }
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|row| decode_row(row).map(|e| (e.path.clone(), e)))
            .collect()
    }

    /// Insert or replace `entries` in a single transaction.
    pub async fn upsert_batch(&self, entries: Vec<LedgerEntry>) -> Result<(), LedgerError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "REPLACE INTO files (path, mtime, status, point_id, error) VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for e in &entries {
                        stmt.execute(params![
                            e.path,
                            e.mtime,
                            e.status.as_str(),
                            e.point_id.map(|id| id.to_string()),
                            e.error,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Flip `paths` to done in a single transaction.
    pub async fn mark_done(&self, paths: Vec<String>) -> Result<(), LedgerError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt =
                        tx.prepare_cached("UPDATE files SET status = 'done', error = NULL WHERE path = ?1")?;
                    for path in &paths {
                        stmt.execute(params![path])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<LedgerCounts, LedgerError> {
        let rows: Vec<(String, i64)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM files GROUP BY status")?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut counts = LedgerCounts::default();
        for (status, n) in rows {
            let n = n.max(0) as u64;
            match status.parse::<Status>() {
                Ok(Status::Pending) => counts.pending = n,
                Ok(Status::Done) => counts.done = n,
                Ok(Status::Error) => counts.error = n,
                Err(reason) => tracing::warn!(status = %status, %reason, "ignoring unknown ledger status"),
            }
        }
        Ok(counts)
    }
}

fn decode_row((path, mtime, status, point_id, error): RawRow) -> Result<LedgerEntry, LedgerError> {
    let status = status.parse::<Status>().map_err(|reason| LedgerError::Corrupt {
        path: path.clone(),
        reason,
    })?;
    let point_id = point_id
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| LedgerError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    Ok(LedgerEntry {
        path,
        mtime,
        status,
        point_id,
        error,
    })
}
