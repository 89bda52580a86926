//! Turn a loaded config into a running executor: drivers, record store,
//! service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sluice_drivers::{DocumentDriver, DriverRegistry, SqliteDriver};
use sluice_executor::{ExecutorConfig, ExecutorService};
use sluice_store::SqliteRecordStore;
use tracing::info;

use crate::AppError;

/// Where relational databases and the record database live when the config
/// leaves them unset.
pub fn resolve_paths(config: &ExecutorConfig, data_dir: &Path) -> (PathBuf, PathBuf) {
    let sqlite_root = config
        .sqlite_root
        .clone()
        .unwrap_or_else(|| data_dir.join("databases"));
    let record_db = config
        .record_db
        .clone()
        .unwrap_or_else(|| data_dir.join("executions.sqlite"));
    (sqlite_root, record_db)
}

pub fn build_drivers(config: &ExecutorConfig, sqlite_root: PathBuf) -> DriverRegistry {
    let documents = DocumentDriver::new();
    for name in &config.document_databases {
        documents.create_database(name);
    }
    DriverRegistry::new()
        .with(Arc::new(SqliteDriver::new(sqlite_root)))
        .with(Arc::new(documents))
}

pub fn build_service(config: ExecutorConfig, data_dir: &Path) -> Result<ExecutorService, AppError> {
    let (sqlite_root, record_db) = resolve_paths(&config, data_dir);
    std::fs::create_dir_all(&sqlite_root)?;
    if let Some(parent) = record_db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Arc::new(SqliteRecordStore::open(&record_db)?);
    let drivers = build_drivers(&config, sqlite_root.clone());
    info!(
        sqlite_root = %sqlite_root.display(),
        record_db = %record_db.display(),
        document_databases = ?config.document_databases,
        "executor wiring resolved"
    );
    Ok(ExecutorService::new(config, drivers, store)?)
}
