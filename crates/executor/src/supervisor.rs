//! Per-request orchestration: admission, `RUNNING` record, watchdog,
//! boundary, proxy loop, terminal record, cleanup.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sluice_core::{
    now_millis, AdmissionRejected, ExecError, ExecutionId, ExecutionRecord, ExecutionRequest,
    TerminalUpdate, SUBSYSTEM_TAG,
};
use sluice_drivers::{DriverRegistry, DriverSession, SessionTag};
use sluice_sandbox::lifecycle::TERMINATED_BY_HOST;
use sluice_sandbox::{BoundaryHandle, BoundaryRuntime, ProxyClient, ProxyRequest};
use sluice_store::{RecordStore, StoreError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::gate::{AdmissionGate, ExecutionSlot};
use crate::metrics::Metrics;
use crate::proxy;
use crate::watchdog::Watchdog;

/// How long a killed boundary gets to unwind before the supervisor stops
/// waiting for it.
const KILL_JOIN_WAIT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Rejected(#[from] AdmissionRejected),
    #[error("record store: {0}")]
    Store(#[from] StoreError),
    #[error("record {0} disappeared")]
    MissingRecord(ExecutionId),
}

/// Every piece of per-execution cleanup, run exactly once on drop no matter
/// how the execution ended, including the future being dropped.
struct ExecutionGuard {
    id: ExecutionId,
    watchdog: Watchdog,
    metrics: Arc<Metrics>,
    session: Option<Arc<dyn DriverSession>>,
    boundary: Option<BoundaryHandle>,
    finished: bool,
    slot: Option<ExecutionSlot>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(boundary) = &self.boundary {
                boundary.terminate();
            }
        }
        self.watchdog.unregister(&self.id);
        if let Some(session) = self.session.take() {
            session.close();
        }
        drop(self.slot.take());
        self.metrics.execution_ended();
        debug!(execution_id = %self.id, "execution cleaned up");
    }
}

/// Resolves once the handle is terminated.
async fn killed(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|killed| *killed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Split a result whose rows exceed `limit` into an inline preview and the
/// full value to spill. `None` means it fits inline.
pub fn shape_result(value: &Value, limit: usize) -> Option<Value> {
    let rows = value.get("rows")?.as_array()?;
    if rows.len() <= limit {
        return None;
    }
    Some(json!({
        "count": value.get("count").cloned().unwrap_or(Value::Null),
        "rows": rows[..limit].to_vec(),
    }))
}

#[derive(Clone)]
pub struct Supervisor {
    config: Arc<ExecutorConfig>,
    gate: AdmissionGate,
    watchdog: Watchdog,
    runtime: Arc<BoundaryRuntime>,
    drivers: DriverRegistry,
    store: Arc<dyn RecordStore>,
    metrics: Arc<Metrics>,
}

impl Supervisor {
    pub fn new(
        config: Arc<ExecutorConfig>,
        gate: AdmissionGate,
        watchdog: Watchdog,
        runtime: Arc<BoundaryRuntime>,
        drivers: DriverRegistry,
        store: Arc<dyn RecordStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            gate,
            watchdog,
            runtime,
            drivers,
            store,
            metrics,
        }
    }

    /// Run a request to its terminal record.
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionRecord, SupervisorError> {
        let slot = self.gate.acquire(&request.submitter_id).await?;
        let guard = self.begin(&request, slot)?;
        self.complete(request, guard).await
    }

    /// Admit a request and continue it in the background. Returns once the
    /// `RUNNING` record exists.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionId, SupervisorError> {
        let slot = self.gate.acquire(&request.submitter_id).await?;
        let guard = self.begin(&request, slot)?;
        let id = request.id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            if let Err(e) = this.complete(request, guard).await {
                error!(execution_id = %id, error = %e, "background execution failed");
            }
        });
        Ok(id)
    }

    /// Write the `RUNNING` record, arm the watchdog, and build the guard.
    fn begin(
        &self,
        request: &ExecutionRequest,
        slot: ExecutionSlot,
    ) -> Result<ExecutionGuard, SupervisorError> {
        let started_at = now_millis();
        // on error the slot drops here and is released
        self.store
            .insert_running(&ExecutionRecord::running(request, started_at))?;
        self.metrics.execution_started();
        let guard = ExecutionGuard {
            id: request.id.clone(),
            watchdog: self.watchdog.clone(),
            metrics: self.metrics.clone(),
            session: None,
            boundary: None,
            finished: false,
            slot: Some(slot),
        };
        let budget = self.config.time_budget(request.time_budget_ms);
        self.watchdog
            .register(&request.id, self.config.watchdog_timeout(budget));
        info!(
            execution_id = %request.id,
            submitter = %request.submitter_id,
            engine = %request.target_engine,
            budget_ms = budget.as_millis() as u64,
            "execution started"
        );
        Ok(guard)
    }

    async fn complete(
        &self,
        request: ExecutionRequest,
        mut guard: ExecutionGuard,
    ) -> Result<ExecutionRecord, SupervisorError> {
        let outcome = self.drive(&request, &mut guard).await;
        guard.finished = true;
        let record = self.finish(&request.id, outcome);
        drop(guard);
        record
    }

    async fn drive(
        &self,
        request: &ExecutionRequest,
        guard: &mut ExecutionGuard,
    ) -> Result<Value, ExecError> {
        let id = &request.id;
        let driver = self.drivers.get(&request.target_engine).ok_or_else(|| {
            ExecError::Capability(format!("unknown engine {}", request.target_engine))
        })?;
        let session: Arc<dyn DriverSession> = driver
            .open(
                &request.target_database,
                SessionTag::new(SUBSYSTEM_TAG, id),
                self.config.proxy.codec(),
            )
            .await
            .map_err(|e| ExecError::Capability(e.sanitized()))?
            .into();
        guard.session = Some(session.clone());
        if !self.watchdog.set_resource_handle(id, session.cancel_handle()) {
            session.cancel_handle().cancel();
        }

        let handle = self.runtime.new_handle();
        guard.boundary = Some(handle.clone());
        if !self.watchdog.set_handle(id, handle.clone()) {
            // fired while the session was opening
            handle.terminate();
        }

        let codec = self.config.proxy.codec();
        let (tx, mut rx) = mpsc::channel::<ProxyRequest>(1);
        let client = ProxyClient::new(tx, self.config.proxy.max_calls, codec);
        let budget = self.config.time_budget(request.time_budget_ms);
        let runtime = self.runtime.clone();
        let source = request.source_text.clone().into_bytes();
        let boundary_handle = handle.clone();
        let mut boundary = tokio::task::spawn_blocking(move || {
            runtime.execute(&source, client, budget, boundary_handle)
        });
        let mut kill_signal = handle.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = killed(&mut kill_signal) => {
                    drop(rx);
                    return Self::after_kill(id, boundary).await;
                }
                joined = &mut boundary => {
                    return joined.unwrap_or_else(|e| {
                        Err(ExecError::Crash(format!("boundary task failed: {e}")))
                    });
                }
                Some(ProxyRequest { call, reply }) = rx.recv() => {
                    tokio::select! {
                        biased;
                        _ = killed(&mut kill_signal) => {
                            drop(reply);
                            drop(rx);
                            return Self::after_kill(id, boundary).await;
                        }
                        resolved = proxy::resolve(&*session, call, &codec, id) => {
                            // the boundary may already be gone
                            let _ = reply.send(resolved);
                        }
                    }
                }
            }
        }
    }

    /// The boundary was force-terminated. With the proxy channel dropped,
    /// a boundary blocked on a call unblocks and traps.
    async fn after_kill(
        id: &str,
        boundary: JoinHandle<Result<Value, ExecError>>,
    ) -> Result<Value, ExecError> {
        if tokio::time::timeout(KILL_JOIN_WAIT, boundary).await.is_err() {
            warn!(execution_id = %id, "killed boundary did not unwind in time");
        }
        Err(ExecError::Crash(TERMINATED_BY_HOST.into()))
    }

    /// Persist the terminal record (first write wins) and return what the
    /// store holds afterwards.
    fn finish(
        &self,
        id: &str,
        outcome: Result<Value, ExecError>,
    ) -> Result<ExecutionRecord, SupervisorError> {
        let finished_at = now_millis();
        let update = match outcome {
            Ok(value) => self.success_update(id, value, finished_at),
            Err(fault) => {
                debug!(execution_id = %id, error = %fault, "execution faulted");
                TerminalUpdate::failure(&fault, finished_at)
            }
        };

        let won = self.store.finish(id, &update)?;
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| SupervisorError::MissingRecord(id.to_string()))?;
        if won {
            self.metrics.record_terminal(&record.status, record.duration_ms);
        }
        info!(execution_id = %id, status = %record.status, duration_ms = ?record.duration_ms, "execution finished");
        Ok(record)
    }

    fn success_update(&self, id: &str, value: Value, finished_at: i64) -> TerminalUpdate {
        let Some(preview) = shape_result(&value, self.config.inline_row_limit) else {
            return TerminalUpdate::success(finished_at, value);
        };
        match self.store.put_spill(id, &value) {
            Ok(pointer) => {
                debug!(execution_id = %id, pointer = %pointer, "result spilled");
                TerminalUpdate::success(finished_at, preview).with_spill(pointer)
            }
            Err(e) => {
                error!(execution_id = %id, error = %e, "failed to spill result");
                TerminalUpdate::failure(&ExecError::Crash("result spill failed".into()), finished_at)
            }
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }
}
