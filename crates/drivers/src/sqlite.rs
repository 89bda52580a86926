//! Relational driver backed by SQLite database files.
//!
//! Databases are `<root>/<name>.sqlite`. A session owns one connection; work
//! runs on the blocking pool so an interrupt from the watchdog can land while
//! the statement is executing.
//!
//! Session connections cannot attach other database files (`ATTACH`,
//! `VACUUM INTO`), so a script only ever reaches the database it was
//! approved for.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::limits::Limit;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde_json::{json, Map, Value};
use sluice_core::{ByteBudget, CodecLimits, EngineKind, Operation};
use tracing::debug;

use crate::session::{SessionInfo, SessionTable, SessionTag};
use crate::{ensure_kind, CancelHandle, DriverError, DriverFuture, DriverSession, ResourceDriver};

const ENGINE: &str = "sqlite";

pub struct SqliteDriver {
    root: PathBuf,
    sessions: Arc<SessionTable>,
}

impl SqliteDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: Arc::new(SessionTable::default()),
        }
    }

    /// Resolve a database name to its file. Names are restricted so a request
    /// cannot walk out of the root directory.
    fn database_path(&self, name: &str) -> Result<PathBuf, DriverError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(DriverError::UnknownDatabase(name.to_string()));
        }
        let path = self.root.join(format!("{name}.sqlite"));
        if !path.is_file() {
            return Err(DriverError::UnknownDatabase(name.to_string()));
        }
        Ok(path)
    }
}

impl ResourceDriver for SqliteDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Relational
    }

    fn open(
        &self,
        database: &str,
        tag: SessionTag,
        limits: CodecLimits,
    ) -> DriverFuture<'_, Box<dyn DriverSession>> {
        let database = database.to_string();
        Box::pin(async move {
            let path = self.database_path(&database)?;
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(engine_error)?;
            conn.set_limit(Limit::SQLITE_LIMIT_ATTACHED, 0);

            let cancel = Arc::new(SqliteCancel {
                interrupt: conn.get_interrupt_handle(),
                cancelled: AtomicBool::new(false),
            });
            let session_id = self.sessions.insert(tag, &database, cancel.clone());
            debug!(session_id, database = %database, "sqlite session opened");

            let session: Box<dyn DriverSession> = Box::new(SqliteSession {
                id: session_id,
                conn: Arc::new(Mutex::new(conn)),
                limits,
                cancel,
                sessions: self.sessions.clone(),
                closed: AtomicBool::new(false),
            });
            Ok(session)
        })
    }

    fn sessions(&self, subsystem: &str) -> Vec<SessionInfo> {
        self.sessions.list(subsystem)
    }

    fn terminate_session(&self, session_id: u64) -> bool {
        self.sessions.terminate(session_id)
    }
}

struct SqliteCancel {
    interrupt: InterruptHandle,
    cancelled: AtomicBool,
}

impl SqliteCancel {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl CancelHandle for SqliteCancel {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.interrupt.interrupt();
    }
}

struct SqliteSession {
    id: u64,
    conn: Arc<Mutex<Connection>>,
    limits: CodecLimits,
    cancel: Arc<SqliteCancel>,
    sessions: Arc<SessionTable>,
    closed: AtomicBool,
}

impl DriverSession for SqliteSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn execute(&self, operation: Operation) -> DriverFuture<'_, Value> {
        Box::pin(async move {
            ensure_kind(&operation, EngineKind::Relational, ENGINE)?;
            if self.closed.load(Ordering::SeqCst) {
                return Err(DriverError::Closed);
            }
            if self.cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }

            let (sql, params, returns_rows) = match operation {
                Operation::Query { sql, params } => (sql, params, true),
                Operation::Execute { sql, params } => (sql, params, false),
                other => {
                    return Err(DriverError::Unsupported {
                        op: other.name(),
                        engine: ENGINE,
                    })
                }
            };

            let conn = self.conn.clone();
            let limits = self.limits;
            let result = tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                run_statement(&conn, &sql, &params, returns_rows, &limits)
            })
            .await
            .map_err(|e| DriverError::Engine {
                category: "worker failed",
                detail: e.to_string(),
            })?;

            // an interrupt can surface as a generic failure mid-step
            match result {
                Err(err @ DriverError::ResultTooLarge { .. }) => Err(err),
                Err(_) if self.cancel.is_cancelled() => Err(DriverError::Cancelled),
                other => other,
            }
        })
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.cancel.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sessions.remove(self.id);
            debug!(session_id = self.id, "sqlite session closed");
        }
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[Value],
    returns_rows: bool,
    limits: &CodecLimits,
) -> Result<Value, DriverError> {
    let bound = params
        .iter()
        .map(json_to_sql)
        .collect::<Result<Vec<_>, _>>()?;
    let mut stmt = conn.prepare(sql).map_err(engine_error)?;

    if !returns_rows {
        let changes = stmt.execute(params_from_iter(bound)).map_err(engine_error)?;
        return Ok(json!({
            "changes": changes,
            "lastInsertRowid": conn.last_insert_rowid(),
        }));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(bound)).map_err(engine_error)?;
    let mut budget = ByteBudget::new(limits);
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(engine_error)? {
        let mut object = Map::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            let value = row.get_ref(index).map_err(engine_error)?;
            object.insert(name.clone(), sql_to_json(value));
        }
        let object = Value::Object(object);
        budget.charge(&object)?;
        out.push(object);
    }
    Ok(Value::Array(out))
}

fn json_to_sql(value: &Value) -> Result<SqlValue, DriverError> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(SqlValue::Integer(i)),
            None => Ok(SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))),
        },
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(DriverError::InvalidArgument(
            "statement parameters must be scalars".into(),
        )),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn engine_error(err: rusqlite::Error) -> DriverError {
    let category = match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::OperationInterrupted => return DriverError::Cancelled,
            ErrorCode::ConstraintViolation => "constraint violation",
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => "database busy",
            ErrorCode::ReadOnly => "read-only database",
            ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => {
                "permission denied"
            }
            ErrorCode::TypeMismatch => "type mismatch",
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => "database unavailable",
            _ => "statement failed",
        },
        rusqlite::Error::InvalidParameterCount(_, _) => "wrong number of parameters",
        rusqlite::Error::ExecuteReturnedResults => "statement returns rows",
        _ => "statement failed",
    };
    debug!(category, error = %err, "sqlite error");
    DriverError::Engine {
        category,
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, SqliteDriver) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("main.sqlite")).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT UNIQUE NOT NULL, score REAL, avatar BLOB);
             INSERT INTO users (email, score, avatar) VALUES ('a@example.com', 1.5, x'CAFE');
             INSERT INTO users (email, score) VALUES ('b@example.com', NULL);",
        )
        .unwrap();
        let driver = SqliteDriver::new(dir.path());
        (dir, driver)
    }

    #[tokio::test]
    async fn test_query_returns_row_objects() {
        let (_dir, driver) = fixture();
        let session = driver
            .open("main", SessionTag::new("sluice", "exec-1"), CodecLimits::default())
            .await
            .unwrap();
        let rows = session
            .execute(Operation::Query {
                sql: "SELECT id, email, score, avatar FROM users WHERE id >= ? ORDER BY id".into(),
                params: vec![json!(1)],
            })
            .await
            .unwrap();
        assert_eq!(rows[0]["email"], "a@example.com");
        assert_eq!(rows[0]["score"], 1.5);
        assert_eq!(rows[0]["avatar"], "cafe");
        assert_eq!(rows[1]["score"], Value::Null);
    }

    #[tokio::test]
    async fn test_execute_reports_changes() {
        let (_dir, driver) = fixture();
        let session = driver
            .open("main", SessionTag::new("sluice", "exec-2"), CodecLimits::default())
            .await
            .unwrap();
        let result = session
            .execute(Operation::Execute {
                sql: "UPDATE users SET score = ?".into(),
                params: vec![json!(9)],
            })
            .await
            .unwrap();
        assert_eq!(result["changes"], 2);
    }

    #[tokio::test]
    async fn test_constraint_error_is_sanitized() {
        let (_dir, driver) = fixture();
        let session = driver
            .open("main", SessionTag::new("sluice", "exec-3"), CodecLimits::default())
            .await
            .unwrap();
        let err = session
            .execute(Operation::Execute {
                sql: "INSERT INTO users (email) VALUES (?)".into(),
                params: vec![json!("a@example.com")],
            })
            .await
            .unwrap_err();
        assert_eq!(err.sanitized(), "database error: constraint violation");
    }

    #[tokio::test]
    async fn test_unknown_and_traversing_database_names() {
        let (_dir, driver) = fixture();
        for name in ["missing", "../main", ""] {
            let result = driver
                .open(name, SessionTag::new("sluice", "x"), CodecLimits::default())
                .await;
            assert!(matches!(result, Err(DriverError::UnknownDatabase(_))));
        }
    }

    #[tokio::test]
    async fn test_document_operation_rejected() {
        let (_dir, driver) = fixture();
        let session = driver
            .open("main", SessionTag::new("sluice", "exec-4"), CodecLimits::default())
            .await
            .unwrap();
        let err = session
            .execute(Operation::CountDocuments {
                collection: "users".into(),
                filter: Value::Null,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_session_tracking_and_terminate() {
        let (_dir, driver) = fixture();
        let session = driver
            .open("main", SessionTag::new("sluice", "exec-5"), CodecLimits::default())
            .await
            .unwrap();
        let listed = driver.sessions("sluice");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tag.execution_id, "exec-5");

        assert!(driver.terminate_session(session.id()));
        let err = session
            .execute(Operation::Query {
                sql: "SELECT 1".into(),
                params: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::Cancelled);
        assert!(driver.sessions("sluice").is_empty());
    }

    #[tokio::test]
    async fn test_attach_outside_root_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("databases");
        std::fs::create_dir(&root).unwrap();
        Connection::open(root.join("main.sqlite"))
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();
        let records = dir.path().join("executions.sqlite");
        Connection::open(&records)
            .unwrap()
            .execute_batch(
                "CREATE TABLE executions (id TEXT, status TEXT);
                 INSERT INTO executions VALUES ('e-1', 'FAILED');",
            )
            .unwrap();

        let driver = SqliteDriver::new(&root);
        let session = driver
            .open("main", SessionTag::new("sluice", "exec-7"), CodecLimits::default())
            .await
            .unwrap();
        let attach = session
            .execute(Operation::Execute {
                sql: "ATTACH DATABASE ? AS rec".into(),
                params: vec![json!(records.to_string_lossy())],
            })
            .await;
        assert!(matches!(attach, Err(DriverError::Engine { .. })));

        let copy = dir.path().join("copy.sqlite");
        let vacuum = session
            .execute(Operation::Execute {
                sql: "VACUUM INTO ?".into(),
                params: vec![json!(copy.to_string_lossy())],
            })
            .await;
        assert!(vacuum.is_err());
        assert!(!copy.exists());

        let status: String = Connection::open(&records)
            .unwrap()
            .query_row("SELECT status FROM executions WHERE id = 'e-1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(status, "FAILED");
    }

    #[tokio::test]
    async fn test_row_stream_stops_at_result_ceiling() {
        let (_dir, driver) = fixture();
        let limits = CodecLimits {
            max_depth: 8,
            max_bytes: 4096,
        };
        let session = driver
            .open("main", SessionTag::new("sluice", "exec-8"), limits)
            .await
            .unwrap();
        let err = session
            .execute(Operation::Query {
                sql: "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) \
                      SELECT i FROM n LIMIT 2000000"
                    .into(),
                params: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::ResultTooLarge { limit: 4096 });

        // rows under the ceiling still come back whole
        let rows = session
            .execute(Operation::Query {
                sql: "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) \
                      SELECT i FROM n LIMIT 100"
                    .into(),
                params: vec![],
            })
            .await
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_dir, driver) = fixture();
        let session = driver
            .open("main", SessionTag::new("sluice", "exec-6"), CodecLimits::default())
            .await
            .unwrap();
        session.close();
        session.close();
        assert!(driver.sessions("sluice").is_empty());
    }
}
