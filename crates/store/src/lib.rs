//! Sluice Store
//!
//! Where execution records live. The executor only needs the insert-then-update
//! lifecycle, a guarded terminal write, a stale-record scan for the reaper,
//! and somewhere to put result sets too large to keep inline.

pub mod sqlite;

use serde_json::Value;
use sluice_core::{ExecutionRecord, TerminalUpdate};
use thiserror::Error;

pub use sqlite::SqliteRecordStore;

/// Prefix of every spill pointer.
pub const SPILL_PREFIX: &str = "spill:";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record {0} already exists")]
    Duplicate(String),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

pub trait RecordStore: Send + Sync {
    /// Persist the `RUNNING` record. Fails if the id is already known.
    fn insert_running(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Apply a terminal write. Returns true only for the first terminal write
    /// to a `RUNNING` record; later writers get false and change nothing.
    fn finish(&self, id: &str, update: &TerminalUpdate) -> Result<bool, StoreError>;

    fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    /// `RUNNING` records started before `started_before` (unix millis).
    fn stale_running(&self, started_before: i64) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Store a full result out of band; returns its pointer. Idempotent for
    /// identical content.
    fn put_spill(&self, execution_id: &str, result: &Value) -> Result<String, StoreError>;

    fn get_spill(&self, pointer: &str) -> Result<Option<Value>, StoreError>;
}

/// Content address used as a spill pointer.
pub fn spill_pointer(body: &[u8]) -> String {
    format!("{SPILL_PREFIX}{}", blake3::hash(body).to_hex())
}
