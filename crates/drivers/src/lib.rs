//! Sluice Drivers
//!
//! The narrow surface the resource proxy uses to reach a live database. One
//! driver per engine; each execution opens exactly one session, tagged with the
//! subsystem identity and execution id so orphans can be found and killed
//! after a crash.
//!
//! - [`sqlite::SqliteDriver`]: relational, parameterized statements.
//! - [`document::DocumentDriver`]: document collections, CRUD plus
//!   chain-then-materialize queries.

pub mod document;
pub mod session;
pub mod sqlite;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use sluice_core::{CodecError, CodecLimits, EngineKind, Operation};
use thiserror::Error;

pub use document::DocumentDriver;
pub use session::{SessionInfo, SessionTag};
pub use sqlite::SqliteDriver;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("unknown database: {0}")]
    UnknownDatabase(String),
    #[error("operation {op} is not supported by the {engine} engine")]
    Unsupported {
        op: &'static str,
        engine: &'static str,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("session closed")]
    Closed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("result exceeds {limit} bytes")]
    ResultTooLarge { limit: usize },
    #[error("{category}: {detail}")]
    Engine {
        category: &'static str,
        detail: String,
    },
}

impl DriverError {
    /// Message safe to hand back to the submitter. Engine detail (SQL text
    /// fragments, file paths, internal codes) is dropped.
    pub fn sanitized(&self) -> String {
        match self {
            Self::Engine { category, .. } => format!("database error: {category}"),
            other => other.to_string(),
        }
    }
}

impl From<CodecError> for DriverError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::PayloadTooLarge { limit } => Self::ResultTooLarge { limit },
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Best-effort cancellation of whatever a session is doing right now.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

/// One engine.
pub trait ResourceDriver: Send + Sync + 'static {
    /// Engine name requests refer to (`"sqlite"`, `"document"`).
    fn name(&self) -> &'static str;

    fn kind(&self) -> EngineKind;

    /// Open a session against `database`, tagged for later reconciliation.
    /// Row-producing operations on the session stop with
    /// [`DriverError::ResultTooLarge`] once their encoded result would cross
    /// `limits.max_bytes`.
    fn open(
        &self,
        database: &str,
        tag: SessionTag,
        limits: CodecLimits,
    ) -> DriverFuture<'_, Box<dyn DriverSession>>;

    /// Live sessions opened under `subsystem`.
    fn sessions(&self, subsystem: &str) -> Vec<SessionInfo>;

    /// Cancel and forget a session. Returns false if it was already gone.
    fn terminate_session(&self, session_id: u64) -> bool;
}

/// A connection bound to one execution.
pub trait DriverSession: Send + Sync {
    fn id(&self) -> u64;

    fn execute(&self, operation: Operation) -> DriverFuture<'_, Value>;

    fn cancel_handle(&self) -> Arc<dyn CancelHandle>;

    /// Release the session. Idempotent.
    fn close(&self);
}

/// Engine name → driver.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn ResourceDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn ResourceDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn with(mut self, driver: Arc<dyn ResourceDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, engine: &str) -> Option<Arc<dyn ResourceDriver>> {
        self.drivers.get(engine).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ResourceDriver>> {
        self.drivers.values()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Reject operations belonging to another engine family.
pub(crate) fn ensure_kind(
    operation: &Operation,
    kind: EngineKind,
    engine: &'static str,
) -> Result<(), DriverError> {
    if operation.kind() == kind {
        Ok(())
    } else {
        Err(DriverError::Unsupported {
            op: operation.name(),
            engine,
        })
    }
}
