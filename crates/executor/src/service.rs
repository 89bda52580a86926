//! Top-level executor service: wires the gate, watchdog, supervisor and
//! reaper together and owns their shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sluice_drivers::DriverRegistry;
use sluice_sandbox::{BoundaryRuntime, SandboxError};
use sluice_store::RecordStore;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::config::{ConfigError, ExecutorConfig};
use crate::gate::{AdmissionGate, GateLimits};
use crate::metrics::Metrics;
use crate::reaper::Reaper;
use crate::supervisor::Supervisor;
use crate::watchdog::Watchdog;

/// Upper bound on how long shutdown waits for killed executions to write
/// their terminal records.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("boundary runtime: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub active: usize,
    pub queued: usize,
    pub watchdog_entries: usize,
    pub engines: Vec<String>,
}

pub struct ExecutorService {
    config: Arc<ExecutorConfig>,
    supervisor: Supervisor,
    reaper: Arc<Reaper>,
    shutdown: watch::Sender<bool>,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorService {
    pub fn new(
        config: ExecutorConfig,
        drivers: DriverRegistry,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let config = Arc::new(config);
        let runtime = Arc::new(BoundaryRuntime::new(config.sandbox.clone())?);
        let metrics = Arc::new(Metrics::new());
        let gate = AdmissionGate::new(GateLimits {
            global_max: config.global_max,
            per_submitter_max: config.per_submitter_max,
            queue_capacity: config.queue_capacity,
            queue_timeout: config.queue_timeout(),
        });
        let watchdog = Watchdog::new(store.clone(), metrics.clone());
        let reaper = Arc::new(Reaper::new(
            store.clone(),
            drivers.clone(),
            metrics.clone(),
            config.stale_after(),
            config.reaper_interval(),
        ));
        let supervisor = Supervisor::new(
            config.clone(),
            gate,
            watchdog,
            runtime,
            drivers,
            store,
            metrics,
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            supervisor,
            reaper,
            shutdown,
            reaper_task: Mutex::new(None),
        })
    }

    /// Start the background reaper. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self.reaper_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        *task = Some(self.reaper.clone().spawn(self.shutdown.subscribe()));
        info!(
            global_max = self.config.global_max,
            per_submitter_max = self.config.per_submitter_max,
            engines = ?self.supervisor.drivers().names(),
            "executor service started"
        );
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.supervisor.metrics()
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.supervisor.store()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            active: self.supervisor.gate().active(),
            queued: self.supervisor.gate().queued(),
            watchdog_entries: self.supervisor.watchdog().active(),
            engines: self
                .supervisor
                .drivers()
                .names()
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Close admission, kill every live execution and stop the reaper.
    /// Returns once the killed executions have written their terminal
    /// records, or after `DRAIN_WAIT`.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let gate = self.supervisor.gate();
        let rejected = gate.close();
        let killed = self.supervisor.watchdog().kill_all();
        if time::timeout(DRAIN_WAIT, gate.wait_idle()).await.is_err() {
            warn!(
                active = gate.active(),
                "executions still running after shutdown wait"
            );
        }
        let task = self
            .reaper_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "reaper task ended abnormally");
            }
        }
        info!(killed, rejected, "executor service stopped");
    }
}
