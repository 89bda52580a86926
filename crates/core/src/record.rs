//! Execution request and terminal record types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ExecError, ExecutionId};

/// Immutable input handed over by the approval workflow. Consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub id: ExecutionId,
    pub source_text: String,
    pub target_engine: String,
    pub target_database: String,
    pub submitter_id: String,
    /// Wall-clock budget. Falls back to the executor default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_budget_ms: Option<u64>,
}

/// Which layer declared the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutSource {
    /// The boundary's own CPU/deadline limits fired inside the engine.
    Cooperative,
    /// The in-process watchdog force-killed the execution.
    Watchdog,
    /// The periodic reaper found the record stuck.
    Reaper,
}

impl TimeoutSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cooperative => "cooperative",
            Self::Watchdog => "watchdog",
            Self::Reaper => "reaper",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cooperative" => Some(Self::Cooperative),
            "watchdog" => Some(Self::Watchdog),
            "reaper" => Some(Self::Reaper),
            _ => None,
        }
    }
}

impl fmt::Display for TimeoutSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure class of a `FAILED` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "lowercase")]
pub enum FailureKind {
    Fault,
    Quota,
    Contract,
    Timeout(TimeoutSource),
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fault => "fault",
            Self::Quota => "quota",
            Self::Contract => "contract",
            Self::Timeout(_) => "timeout",
        }
    }

    pub fn timeout_source(&self) -> Option<TimeoutSource> {
        match self {
            Self::Timeout(source) => Some(*source),
            _ => None,
        }
    }

    /// Rebuild from the two persisted columns.
    pub fn from_parts(kind: &str, source: Option<&str>) -> Option<Self> {
        match kind {
            "fault" => Some(Self::Fault),
            "quota" => Some(Self::Quota),
            "contract" => Some(Self::Contract),
            "timeout" => source.and_then(TimeoutSource::parse).map(Self::Timeout),
            _ => None,
        }
    }
}

/// `RUNNING` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "failure", rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed(FailureKind),
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed(_) => "FAILED",
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            Self::Failed(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(FailureKind::Timeout(source)) => write!(f, "FAILED(timeout/{source})"),
            Self::Failed(kind) => write!(f, "FAILED({})", kind.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Persisted outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub submitter_id: String,
    pub target_engine: String,
    pub target_database: String,
    pub status: ExecutionStatus,
    /// Unix millis.
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub is_truncated: bool,
    pub result_pointer: Option<String>,
}

impl ExecutionRecord {
    /// The record inserted when a slot is granted.
    pub fn running(request: &ExecutionRequest, started_at: i64) -> Self {
        Self {
            id: request.id.clone(),
            submitter_id: request.submitter_id.clone(),
            target_engine: request.target_engine.clone(),
            target_database: request.target_database.clone(),
            status: ExecutionStatus::Running,
            started_at,
            finished_at: None,
            duration_ms: None,
            result: None,
            error: None,
            is_truncated: false,
            result_pointer: None,
        }
    }
}

/// Terminal write applied to a `RUNNING` record. Duration is derived by the
/// store from the persisted start time.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalUpdate {
    pub status: ExecutionStatus,
    pub finished_at: i64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub is_truncated: bool,
    pub result_pointer: Option<String>,
}

impl TerminalUpdate {
    pub fn success(finished_at: i64, result: Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            finished_at,
            result: Some(result),
            error: None,
            is_truncated: false,
            result_pointer: None,
        }
    }

    pub fn failure(err: &ExecError, finished_at: i64) -> Self {
        Self {
            status: ExecutionStatus::Failed(err.failure_kind()),
            finished_at,
            result: None,
            error: Some(err.to_string()),
            is_truncated: false,
            result_pointer: None,
        }
    }

    /// Mark the inline result as a preview of a spilled full result.
    pub fn with_spill(mut self, pointer: String) -> Self {
        self.is_truncated = true;
        self.result_pointer = Some(pointer);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_camel_case() {
        let json = serde_json::json!({
            "id": "exec-1",
            "sourceText": "(module)",
            "targetEngine": "sqlite",
            "targetDatabase": "main",
            "submitterId": "alice"
        });
        let req: ExecutionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.submitter_id, "alice");
        assert_eq!(req.time_budget_ms, None);
    }

    #[test]
    fn test_failure_kind_parts() {
        for kind in [
            FailureKind::Fault,
            FailureKind::Quota,
            FailureKind::Contract,
            FailureKind::Timeout(TimeoutSource::Reaper),
        ] {
            let source = kind.timeout_source().map(|s| s.as_str());
            assert_eq!(FailureKind::from_parts(kind.as_str(), source), Some(kind));
        }
        assert_eq!(FailureKind::from_parts("timeout", None), None);
        assert_eq!(FailureKind::from_parts("nope", None), None);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ExecutionStatus::Running.to_string(), "RUNNING");
        assert_eq!(
            ExecutionStatus::Failed(FailureKind::Timeout(TimeoutSource::Watchdog)).to_string(),
            "FAILED(timeout/watchdog)"
        );
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
    }

    #[test]
    fn test_terminal_update_failure() {
        let update = TerminalUpdate::failure(&ExecError::Quota("101 calls".into()), 42);
        assert_eq!(update.status, ExecutionStatus::Failed(FailureKind::Quota));
        assert!(update.error.unwrap().contains("101 calls"));
        assert!(update.result.is_none());
    }
}
