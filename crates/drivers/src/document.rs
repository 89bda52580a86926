//! In-process document engine.
//!
//! Databases hold named collections of JSON objects. Filters support equality
//! on (dotted) paths plus `$eq $ne $gt $gte $lt $lte $in $nin $exists`, and
//! `$and` / `$or` at the top level. Updates support `$set` and `$unset`.

use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Map, Value};
use sluice_core::{ByteBudget, ChainStep, CodecLimits, EngineKind, Operation, SortDirection};
use tracing::debug;

use crate::session::{SessionInfo, SessionTable, SessionTag};
use crate::{ensure_kind, CancelHandle, DriverError, DriverFuture, DriverSession, ResourceDriver};

const ENGINE: &str = "document";

type Collections = HashMap<String, Vec<Value>>;

#[derive(Default)]
struct Store {
    databases: RwLock<HashMap<String, Collections>>,
    next_id: AtomicU64,
}

impl Store {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Collections>> {
        self.databases.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Collections>> {
        self.databases.write().unwrap_or_else(|e| e.into_inner())
    }

    fn assign_id(&self) -> Value {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Value::String(format!("{n:016x}"))
    }
}

#[derive(Default)]
pub struct DocumentDriver {
    store: Arc<Store>,
    sessions: Arc<SessionTable>,
}

impl DocumentDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty database. Returns false if it already existed.
    pub fn create_database(&self, name: &str) -> bool {
        let mut databases = self.store.write();
        if databases.contains_key(name) {
            return false;
        }
        databases.insert(name.to_string(), Collections::new());
        true
    }

    /// Append documents to a collection, creating database and collection as
    /// needed. Documents without `_id` get one assigned.
    pub fn seed(&self, database: &str, collection: &str, documents: Vec<Value>) {
        let mut databases = self.store.write();
        let docs = databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        for mut document in documents {
            if let Value::Object(map) = &mut document {
                if !map.contains_key("_id") {
                    map.insert("_id".into(), self.store.assign_id());
                }
            }
            docs.push(document);
        }
    }
}

impl ResourceDriver for DocumentDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Document
    }

    fn open(
        &self,
        database: &str,
        tag: SessionTag,
        limits: CodecLimits,
    ) -> DriverFuture<'_, Box<dyn DriverSession>> {
        let database = database.to_string();
        Box::pin(async move {
            if !self.store.read().contains_key(&database) {
                return Err(DriverError::UnknownDatabase(database));
            }
            let cancel = Arc::new(DocumentCancel::default());
            let session_id = self.sessions.insert(tag, &database, cancel.clone());
            debug!(session_id, database = %database, "document session opened");

            let session: Box<dyn DriverSession> = Box::new(DocumentSession {
                id: session_id,
                database,
                store: self.store.clone(),
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

#[derive(Default)]
struct DocumentCancel(AtomicBool);

impl DocumentCancel {
    fn check(&self) -> Result<(), DriverError> {
        if self.0.load(Ordering::SeqCst) {
            Err(DriverError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl CancelHandle for DocumentCancel {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct DocumentSession {
    id: u64,
    database: String,
    store: Arc<Store>,
    limits: CodecLimits,
    cancel: Arc<DocumentCancel>,
    sessions: Arc<SessionTable>,
    closed: AtomicBool,
}

impl DocumentSession {
    fn apply(&self, operation: Operation) -> Result<Value, DriverError> {
        let cancel = &*self.cancel;
        match operation {
            Operation::InsertOne {
                collection,
                document,
            } => {
                let ids = self.insert(&collection, vec![document])?;
                Ok(json!({ "insertedId": ids[0] }))
            }
            Operation::InsertMany {
                collection,
                documents,
            } => {
                let ids = self.insert(&collection, documents)?;
                Ok(json!({ "insertedCount": ids.len(), "insertedIds": ids }))
            }
            Operation::FindOne { collection, filter } => {
                let databases = self.store.read();
                for doc in self.collection(&databases, &collection) {
                    cancel.check()?;
                    if matches_filter(doc, &filter)? {
                        return Ok(doc.clone());
                    }
                }
                Ok(Value::Null)
            }
            Operation::CountDocuments { collection, filter } => {
                let databases = self.store.read();
                let mut count = 0u64;
                for doc in self.collection(&databases, &collection) {
                    cancel.check()?;
                    if matches_filter(doc, &filter)? {
                        count += 1;
                    }
                }
                Ok(json!({ "count": count }))
            }
            Operation::UpdateMany {
                collection,
                filter,
                update,
            } => {
                let update = UpdateSpec::parse(&update)?;
                let mut databases = self.store.write();
                let docs = self.collection_mut(&mut databases, &collection)?;
                let (mut matched, mut modified) = (0u64, 0u64);
                for doc in docs.iter_mut() {
                    cancel.check()?;
                    if matches_filter(doc, &filter)? {
                        matched += 1;
                        if update.apply(doc) {
                            modified += 1;
                        }
                    }
                }
                Ok(json!({ "matchedCount": matched, "modifiedCount": modified }))
            }
            Operation::DeleteMany { collection, filter } => {
                let mut databases = self.store.write();
                let docs = self.collection_mut(&mut databases, &collection)?;
                // decide every document first so a failure deletes nothing
                let mut doomed = Vec::with_capacity(docs.len());
                for doc in docs.iter() {
                    cancel.check()?;
                    doomed.push(matches_filter(doc, &filter)?);
                }
                let deleted = doomed.iter().filter(|d| **d).count();
                let mut flags = doomed.into_iter();
                docs.retain(|_| !flags.next().unwrap_or(false));
                Ok(json!({ "deletedCount": deleted }))
            }
            Operation::Materialize {
                collection,
                filter,
                chain,
            } => {
                let databases = self.store.read();
                let mut selected = Vec::new();
                for doc in self.collection(&databases, &collection) {
                    cancel.check()?;
                    if matches_filter(doc, &filter)? {
                        selected.push(Cow::Borrowed(doc));
                    }
                }
                for step in &chain {
                    cancel.check()?;
                    selected = apply_step(selected, step);
                }
                // only the documents that survive the chain are copied out
                let mut budget = ByteBudget::new(&self.limits);
                let mut out = Vec::with_capacity(selected.len());
                for doc in selected {
                    budget.charge(&doc)?;
                    out.push(doc.into_owned());
                }
                Ok(Value::Array(out))
            }
            other => Err(DriverError::Unsupported {
                op: other.name(),
                engine: ENGINE,
            }),
        }
    }

    fn insert(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<Value>, DriverError> {
        let mut prepared = Vec::with_capacity(documents.len());
        for document in documents {
            let Value::Object(mut map) = document else {
                return Err(DriverError::InvalidArgument(
                    "documents must be objects".into(),
                ));
            };
            let id = match map.get("_id") {
                Some(id) => id.clone(),
                None => {
                    let id = self.store.assign_id();
                    map.insert("_id".into(), id.clone());
                    id
                }
            };
            prepared.push((id, Value::Object(map)));
        }

        let mut databases = self.store.write();
        let docs = databases
            .get_mut(&self.database)
            .ok_or_else(|| DriverError::UnknownDatabase(self.database.clone()))?
            .entry(collection.to_string())
            .or_default();
        for (index, (id, _)) in prepared.iter().enumerate() {
            let clash = docs.iter().any(|doc| doc.get("_id") == Some(id))
                || prepared[..index].iter().any(|(other, _)| other == id);
            if clash {
                return Err(DriverError::Engine {
                    category: "duplicate key",
                    detail: format!("_id {id} already exists in {collection}"),
                });
            }
        }
        let ids = prepared.iter().map(|(id, _)| id.clone()).collect();
        docs.extend(prepared.into_iter().map(|(_, doc)| doc));
        Ok(ids)
    }

    fn collection<'a>(
        &self,
        databases: &'a HashMap<String, Collections>,
        collection: &str,
    ) -> &'a [Value] {
        databases
            .get(&self.database)
            .and_then(|db| db.get(collection))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn collection_mut<'a>(
        &self,
        databases: &'a mut HashMap<String, Collections>,
        collection: &str,
    ) -> Result<&'a mut Vec<Value>, DriverError> {
        Ok(databases
            .get_mut(&self.database)
            .ok_or_else(|| DriverError::UnknownDatabase(self.database.clone()))?
            .entry(collection.to_string())
            .or_default())
    }
}

impl DriverSession for DocumentSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn execute(&self, operation: Operation) -> DriverFuture<'_, Value> {
        Box::pin(async move {
            ensure_kind(&operation, EngineKind::Document, ENGINE)?;
            if self.closed.load(Ordering::SeqCst) {
                return Err(DriverError::Closed);
            }
            self.cancel.check()?;
            self.apply(operation)
        })
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.cancel.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sessions.remove(self.id);
            debug!(session_id = self.id, "document session closed");
        }
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Value at a dotted path. Missing fields read as `None`.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, key| current.get(key))
}

fn matches_filter(doc: &Value, filter: &Value) -> Result<bool, DriverError> {
    let conditions = match filter {
        Value::Null => return Ok(true),
        Value::Object(map) => map,
        _ => {
            return Err(DriverError::InvalidArgument(
                "filter must be an object".into(),
            ))
        }
    };
    for (key, condition) in conditions {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(condition)? {
                    all &= matches_filter(doc, clause)?;
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(condition)? {
                    any |= matches_filter(doc, clause)?;
                }
                any
            }
            op if op.starts_with('$') => {
                return Err(DriverError::InvalidArgument(format!(
                    "unsupported filter operator {op}"
                )))
            }
            path => matches_condition(lookup(doc, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses(condition: &Value) -> Result<&Vec<Value>, DriverError> {
    condition
        .as_array()
        .ok_or_else(|| DriverError::InvalidArgument("$and/$or take an array".into()))
}

fn is_operator_map(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn matches_condition(field: Option<&Value>, condition: &Value) -> Result<bool, DriverError> {
    let value = field.unwrap_or(&Value::Null);
    if !is_operator_map(condition) {
        return Ok(value == condition);
    }
    let Value::Object(ops) = condition else {
        return Ok(false);
    };
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => value == operand,
            "$ne" => value != operand,
            "$gt" => compare_same_type(value, operand) == Some(CmpOrdering::Greater),
            "$gte" => matches!(
                compare_same_type(value, operand),
                Some(CmpOrdering::Greater | CmpOrdering::Equal)
            ),
            "$lt" => compare_same_type(value, operand) == Some(CmpOrdering::Less),
            "$lte" => matches!(
                compare_same_type(value, operand),
                Some(CmpOrdering::Less | CmpOrdering::Equal)
            ),
            "$in" => in_list(value, operand)?,
            "$nin" => !in_list(value, operand)?,
            "$exists" => field.is_some() == operand.as_bool().unwrap_or(true),
            other => {
                return Err(DriverError::InvalidArgument(format!(
                    "unsupported filter operator {other}"
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(value: &Value, operand: &Value) -> Result<bool, DriverError> {
    let list = operand
        .as_array()
        .ok_or_else(|| DriverError::InvalidArgument("$in/$nin take an array".into()))?;
    Ok(list.contains(value))
}

/// Ordering between two values of the same scalar type; `None` otherwise.
fn compare_same_type(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order used by `sort`: null < bool < number < string < array < object.
fn sort_order(a: &Value, b: &Value) -> CmpOrdering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    rank(a)
        .cmp(&rank(b))
        .then_with(|| compare_same_type(a, b).unwrap_or(CmpOrdering::Equal))
}

fn apply_step<'a>(docs: Vec<Cow<'a, Value>>, step: &ChainStep) -> Vec<Cow<'a, Value>> {
    match step {
        ChainStep::Sort(keys) => {
            let mut docs = docs;
            docs.sort_by(|a, b| {
                keys.iter().fold(CmpOrdering::Equal, |acc, (path, direction)| {
                    acc.then_with(|| {
                        let ord = sort_order(
                            lookup(a, path).unwrap_or(&Value::Null),
                            lookup(b, path).unwrap_or(&Value::Null),
                        );
                        match direction {
                            SortDirection::Asc => ord,
                            SortDirection::Desc => ord.reverse(),
                        }
                    })
                })
            });
            docs
        }
        ChainStep::Skip(n) => docs.into_iter().skip(*n).collect(),
        ChainStep::Limit(n) => docs.into_iter().take(*n).collect(),
        ChainStep::Project(fields) => docs
            .iter()
            .map(|doc| Cow::Owned(project(doc, fields)))
            .collect(),
    }
}

fn project(doc: &Value, fields: &[String]) -> Value {
    let mut out = Value::Object(Map::new());
    if let Some(id) = doc.get("_id") {
        set_path(&mut out, "_id", id.clone());
    }
    for field in fields {
        if let Some(value) = lookup(doc, field) {
            set_path(&mut out, field, value.clone());
        }
    }
    out
}

/// Write `value` at a dotted path, creating intermediate objects. A
/// non-object in the way is replaced.
fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut keys = path.split('.').peekable();
    while let Some(key) = keys.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { return };
        if keys.peek().is_none() {
            map.insert(key.to_string(), value);
            return;
        }
        current = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn remove_path(doc: &mut Value, path: &str) -> bool {
    match path.rsplit_once('.') {
        None => doc
            .as_object_mut()
            .map(|map| map.remove(path).is_some())
            .unwrap_or(false),
        Some((parent, leaf)) => {
            let mut current = doc;
            for key in parent.split('.') {
                match current.get_mut(key) {
                    Some(next) => current = next,
                    None => return false,
                }
            }
            current
                .as_object_mut()
                .map(|map| map.remove(leaf).is_some())
                .unwrap_or(false)
        }
    }
}

struct UpdateSpec {
    set: Vec<(String, Value)>,
    unset: Vec<String>,
}

impl UpdateSpec {
    fn parse(update: &Value) -> Result<Self, DriverError> {
        let map = update
            .as_object()
            .filter(|map| !map.is_empty())
            .ok_or_else(|| DriverError::InvalidArgument("update must be a non-empty object".into()))?;
        let mut spec = UpdateSpec {
            set: Vec::new(),
            unset: Vec::new(),
        };
        for (op, fields) in map {
            let fields = fields.as_object().ok_or_else(|| {
                DriverError::InvalidArgument(format!("{op} takes an object of fields"))
            })?;
            for (path, value) in fields {
                if path == "_id" || path.starts_with("_id.") {
                    return Err(DriverError::InvalidArgument("_id is immutable".into()));
                }
                match op.as_str() {
                    "$set" => spec.set.push((path.clone(), value.clone())),
                    "$unset" => spec.unset.push(path.clone()),
                    other => {
                        return Err(DriverError::InvalidArgument(format!(
                            "unsupported update operator {other}"
                        )))
                    }
                }
            }
        }
        Ok(spec)
    }

    /// Apply to one document; true if anything changed.
    fn apply(&self, doc: &mut Value) -> bool {
        let mut changed = false;
        for (path, value) in &self.set {
            if lookup(doc, path) != Some(value) {
                set_path(doc, path, value.clone());
                changed = true;
            }
        }
        for path in &self.unset {
            changed |= remove_path(doc, path);
        }
        changed
    }
}
