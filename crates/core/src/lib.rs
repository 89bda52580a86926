//! Sluice Core
//!
//! Types, errors, and wire shapes shared by every sluice crate: the execution
//! request/record lifecycle, the closed set of proxied operations, and the
//! bounded JSON codec every value crosses on its way in or out of a boundary.

pub mod codec;
pub mod operation;
pub mod record;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use codec::{ByteBudget, CodecError, CodecLimits};
pub use operation::{ChainStep, EngineKind, Operation, ResourceCall, SortDirection};
pub use record::{
    ExecutionRecord, ExecutionRequest, ExecutionStatus, FailureKind, TerminalUpdate,
    TimeoutSource,
};

/// Execution identifier, assigned by the upstream approval workflow.
pub type ExecutionId = String;

/// Identity tag every driver session opened by this subsystem carries.
pub const SUBSYSTEM_TAG: &str = "sluice";

/// Rejection from the admission gate. Surfaces synchronously, before any
/// record exists for the request.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionRejected {
    #[error("OVERLOADED: no execution slot or queue space available")]
    Overloaded,
    #[error("USER_LIMIT: submitter {submitter} is at its limit of {limit} executions")]
    UserLimit { submitter: String, limit: usize },
}

impl AdmissionRejected {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Overloaded => "OVERLOADED",
            Self::UserLimit { .. } => "USER_LIMIT",
        }
    }
}

/// Faults captured during an execution. Every variant ends up in the
/// terminal record; none of them escapes as an unhandled error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("contract violation: {0}")]
    Contract(String),
    #[error("capability fault: {0}")]
    Capability(String),
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("serialization fault: {0}")]
    Serialization(String),
    #[error("timeout ({0})")]
    Timeout(TimeoutSource),
    #[error("boundary crashed: {0}")]
    Crash(String),
}

impl ExecError {
    /// The terminal failure class recorded for this fault.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Contract(_) => FailureKind::Contract,
            Self::Quota(_) => FailureKind::Quota,
            Self::Timeout(source) => FailureKind::Timeout(*source),
            Self::Capability(_) | Self::Serialization(_) | Self::Crash(_) => FailureKind::Fault,
        }
    }
}

impl From<CodecError> for ExecError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::PayloadTooLarge { .. } => Self::Quota(err.to_string()),
            CodecError::TooDeep { .. } => Self::Serialization(err.to_string()),
            CodecError::Malformed(_) => Self::Contract(err.to_string()),
        }
    }
}

/// Current unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
