use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde_json::Value;
use sluice_core::{now_millis, ExecutionRecord, ExecutionStatus, FailureKind, TerminalUpdate};
use tracing::debug;

use crate::{spill_pointer, RecordStore, StoreError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        submitter_id TEXT NOT NULL,
        target_engine TEXT NOT NULL,
        target_database TEXT NOT NULL,
        status TEXT NOT NULL,
        failure_kind TEXT,
        timeout_source TEXT,
        started_at INTEGER NOT NULL,
        finished_at INTEGER,
        duration_ms INTEGER,
        result TEXT,
        error TEXT,
        is_truncated INTEGER NOT NULL DEFAULT 0,
        result_pointer TEXT
    );

    CREATE INDEX IF NOT EXISTS executions_status_started
        ON executions (status, started_at);

    CREATE TABLE IF NOT EXISTS result_spills (
        pointer TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );";

const COLUMNS: &str = "id, submitter_id, target_engine, target_database, status, failure_kind,
    timeout_source, started_at, finished_at, duration_ms, result, error, is_truncated,
    result_pointer";

/// Record store on a single SQLite connection.
pub struct SqliteRecordStore {
    db: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Connection::open(path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self, StoreError> {
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn db(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_json(value: &Option<Value>) -> Result<Option<String>, StoreError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

/// Raw columns of one `executions` row; decoded outside the rusqlite closure
/// so parse failures become `StoreError::Corrupt`.
struct RawRecord {
    id: String,
    submitter_id: String,
    target_engine: String,
    target_database: String,
    status: String,
    failure_kind: Option<String>,
    timeout_source: Option<String>,
    started_at: i64,
    finished_at: Option<i64>,
    duration_ms: Option<i64>,
    result: Option<String>,
    error: Option<String>,
    is_truncated: bool,
    result_pointer: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            submitter_id: row.get(1)?,
            target_engine: row.get(2)?,
            target_database: row.get(3)?,
            status: row.get(4)?,
            failure_kind: row.get(5)?,
            timeout_source: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
            duration_ms: row.get(9)?,
            result: row.get(10)?,
            error: row.get(11)?,
            is_truncated: row.get(12)?,
            result_pointer: row.get(13)?,
        })
    }

    fn decode(self) -> Result<ExecutionRecord, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let status = match self.status.as_str() {
            "RUNNING" => ExecutionStatus::Running,
            "SUCCESS" => ExecutionStatus::Success,
            "FAILED" => {
                let kind = self.failure_kind.as_deref().unwrap_or_default();
                FailureKind::from_parts(kind, self.timeout_source.as_deref())
                    .map(ExecutionStatus::Failed)
                    .ok_or_else(|| corrupt(format!("unknown failure kind {kind:?}")))?
            }
            other => return Err(corrupt(format!("unknown status {other:?}"))),
        };
        let result = match &self.result {
            Some(text) => Some(serde_json::from_str(text).map_err(|e| corrupt(e.to_string()))?),
            None => None,
        };
        Ok(ExecutionRecord {
            id: self.id,
            submitter_id: self.submitter_id,
            target_engine: self.target_engine,
            target_database: self.target_database,
            status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            result,
            error: self.error,
            is_truncated: self.is_truncated,
            result_pointer: self.result_pointer,
        })
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert_running(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let inserted = self.db().execute(
            "INSERT INTO executions (id, submitter_id, target_engine, target_database, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'RUNNING', ?5)",
            params![
                record.id,
                record.submitter_id,
                record.target_engine,
                record.target_database,
                record.started_at,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::Duplicate(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finish(&self, id: &str, update: &TerminalUpdate) -> Result<bool, StoreError> {
        let failure = update.status.failure();
        let changed = self.db().execute(
            "UPDATE executions SET
                status = ?2,
                failure_kind = ?3,
                timeout_source = ?4,
                finished_at = ?5,
                duration_ms = MAX(?5 - started_at, 0),
                result = ?6,
                error = ?7,
                is_truncated = ?8,
                result_pointer = ?9
             WHERE id = ?1 AND status = 'RUNNING'",
            params![
                id,
                update.status.as_str(),
                failure.map(|f| f.as_str()),
                failure.and_then(|f| f.timeout_source()).map(|s| s.as_str()),
                update.finished_at,
                to_json(&update.result)?,
                update.error,
                update.is_truncated,
                update.result_pointer,
            ],
        )?;
        if changed == 0 {
            debug!(execution_id = %id, status = %update.status, "terminal write lost the race");
        }
        Ok(changed == 1)
    }

    fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let raw = self
            .db()
            .query_row(
                &format!("SELECT {COLUMNS} FROM executions WHERE id = ?1"),
                params![id],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    fn stale_running(&self, started_before: i64) -> Result<Vec<ExecutionRecord>, StoreError> {
        let raws = {
            let db = self.db();
            let mut stmt = db.prepare(&format!(
                "SELECT {COLUMNS} FROM executions
                 WHERE status = 'RUNNING' AND started_at < ?1
                 ORDER BY started_at"
            ))?;
            let rows = stmt.query_map(params![started_before], RawRecord::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raws.into_iter().map(RawRecord::decode).collect()
    }

    fn put_spill(&self, execution_id: &str, result: &Value) -> Result<String, StoreError> {
        let body = serde_json::to_string(result)?;
        let pointer = spill_pointer(body.as_bytes());
        self.db().execute(
            "INSERT OR IGNORE INTO result_spills (pointer, execution_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![pointer, execution_id, body, now_millis()],
        )?;
        Ok(pointer)
    }

    fn get_spill(&self, pointer: &str) -> Result<Option<Value>, StoreError> {
        let body: Option<String> = self
            .db()
            .query_row(
                "SELECT body FROM result_spills WHERE pointer = ?1",
                params![pointer],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }
}
