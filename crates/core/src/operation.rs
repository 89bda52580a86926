//! The closed set of operations a boundary may ask the proxy to perform.
//!
//! Dispatch is by pattern match on a tagged variant; there is no forwarding of
//! arbitrary driver method names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Family of engine an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Relational,
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One step of a lazy document query chain, replayed host-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStep {
    /// `{"sort": [["age", "desc"], ["name", "asc"]]}`
    Sort(Vec<(String, SortDirection)>),
    Skip(usize),
    Limit(usize),
    /// `{"project": ["name", "age"]}`
    Project(Vec<String>),
}

/// A single proxied operation. `filter` defaults to `null`, which matches
/// every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Query {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Execute {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    InsertOne {
        collection: String,
        document: Value,
    },
    InsertMany {
        collection: String,
        documents: Vec<Value>,
    },
    FindOne {
        collection: String,
        #[serde(default)]
        filter: Value,
    },
    UpdateMany {
        collection: String,
        #[serde(default)]
        filter: Value,
        update: Value,
    },
    DeleteMany {
        collection: String,
        #[serde(default)]
        filter: Value,
    },
    CountDocuments {
        collection: String,
        #[serde(default)]
        filter: Value,
    },
    /// Terminal call of a chained query: the whole chain travels in one message
    /// and comes back as a fully materialized list.
    Materialize {
        collection: String,
        #[serde(default)]
        filter: Value,
        #[serde(default)]
        chain: Vec<ChainStep>,
    },
}

impl Operation {
    /// The engine family this operation requires.
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Query { .. } | Self::Execute { .. } => EngineKind::Relational,
            _ => EngineKind::Document,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Execute { .. } => "execute",
            Self::InsertOne { .. } => "insert_one",
            Self::InsertMany { .. } => "insert_many",
            Self::FindOne { .. } => "find_one",
            Self::UpdateMany { .. } => "update_many",
            Self::DeleteMany { .. } => "delete_many",
            Self::CountDocuments { .. } => "count_documents",
            Self::Materialize { .. } => "materialize",
        }
    }
}

/// One proxied call issued by a boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCall {
    /// 1-based sequence number within the execution.
    pub call_id: u32,
    pub operation: Operation,
}
