//! Per-driver table of open sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use sluice_core::now_millis;

use crate::CancelHandle;

/// Identity a session is opened under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTag {
    pub subsystem: String,
    pub execution_id: String,
}

impl SessionTag {
    pub fn new(subsystem: &str, execution_id: &str) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            execution_id: execution_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u64,
    pub tag: SessionTag,
    pub database: String,
    /// Unix millis.
    pub opened_at: i64,
}

impl SessionInfo {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "sessionId": self.session_id,
            "subsystem": self.tag.subsystem,
            "executionId": self.tag.execution_id,
            "database": self.database,
            "openedAt": self.opened_at,
        })
    }
}

struct SessionEntry {
    info: SessionInfo,
    cancel: Arc<dyn CancelHandle>,
}

#[derive(Default)]
pub(crate) struct SessionTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, SessionEntry>>,
}

impl SessionTable {
    pub(crate) fn insert(
        &self,
        tag: SessionTag,
        database: &str,
        cancel: Arc<dyn CancelHandle>,
    ) -> u64 {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = SessionInfo {
            session_id,
            tag,
            database: database.to_string(),
            opened_at: now_millis(),
        };
        self.lock().insert(session_id, SessionEntry { info, cancel });
        session_id
    }

    pub(crate) fn remove(&self, session_id: u64) -> bool {
        self.lock().remove(&session_id).is_some()
    }

    pub(crate) fn list(&self, subsystem: &str) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .lock()
            .values()
            .filter(|entry| entry.info.tag.subsystem == subsystem)
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by_key(|info| info.session_id);
        sessions
    }

    /// Cancel the session's in-flight work and drop it from the table.
    pub(crate) fn terminate(&self, session_id: u64) -> bool {
        let entry = self.lock().remove(&session_id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SessionEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
