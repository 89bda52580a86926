//! Independent kill timers, one per live execution.
//!
//! A fire bypasses the supervisor entirely: it writes `FAILED(timeout/watchdog)`
//! itself, then kills whatever handles have been bound so far. The record is
//! written before the boundary is terminated so the supervisor, woken by the
//! kill, always loses the terminal-write race.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sluice_core::{now_millis, ExecError, ExecutionId, TerminalUpdate, TimeoutSource};
use sluice_drivers::CancelHandle;
use sluice_sandbox::BoundaryHandle;
use sluice_store::RecordStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::metrics::Metrics;

struct WatchdogEntry {
    timer: JoinHandle<()>,
    boundary: Option<BoundaryHandle>,
    resource: Option<Arc<dyn CancelHandle>>,
    registered_at: Instant,
}

impl WatchdogEntry {
    fn kill(&self) {
        if let Some(boundary) = &self.boundary {
            boundary.terminate();
        }
        if let Some(resource) = &self.resource {
            resource.cancel();
        }
    }
}

/// Lifetime totals, for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchdogStats {
    pub registered: u64,
    pub unregistered: u64,
    pub fired: u64,
    pub killed_on_shutdown: u64,
}

struct WatchdogInner {
    entries: DashMap<ExecutionId, WatchdogEntry>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<Metrics>,
    registered: AtomicU64,
    unregistered: AtomicU64,
    fired: AtomicU64,
    killed_on_shutdown: AtomicU64,
}

impl WatchdogInner {
    fn fire(&self, id: &str) {
        let Some((_, entry)) = self.entries.remove(id) else {
            return;
        };
        self.fired.fetch_add(1, Ordering::Relaxed);
        let elapsed = entry.registered_at.elapsed();

        let fault = ExecError::Timeout(TimeoutSource::Watchdog);
        let update = TerminalUpdate::failure(&fault, now_millis());
        match self.store.finish(id, &update) {
            Ok(true) => {
                self.metrics
                    .record_terminal(&update.status, Some(elapsed.as_millis() as u64));
                warn!(execution_id = %id, elapsed_ms = elapsed.as_millis() as u64, "watchdog killed execution");
            }
            Ok(false) => debug!(execution_id = %id, "watchdog fired after terminal write"),
            Err(e) => error!(execution_id = %id, error = %e, "watchdog failed to write terminal record"),
        }
        entry.kill();
    }
}

/// Registry of kill timers keyed by execution id. Cheap to clone.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    pub fn new(store: Arc<dyn RecordStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                entries: DashMap::new(),
                store,
                metrics,
                registered: AtomicU64::new(0),
                unregistered: AtomicU64::new(0),
                fired: AtomicU64::new(0),
                killed_on_shutdown: AtomicU64::new(0),
            }),
        }
    }

    /// Start the kill timer. Must be called from within a tokio runtime.
    pub fn register(&self, id: &str, timeout: Duration) {
        let inner = self.inner.clone();
        let timer_id = id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner.fire(&timer_id);
        });
        let entry = WatchdogEntry {
            timer,
            boundary: None,
            resource: None,
            registered_at: Instant::now(),
        };
        if let Some(previous) = self.inner.entries.insert(id.to_string(), entry) {
            previous.timer.abort();
        }
        self.inner.registered.fetch_add(1, Ordering::Relaxed);
        debug!(execution_id = %id, timeout_ms = timeout.as_millis() as u64, "watchdog armed");
    }

    /// Bind the boundary handle. False when the entry is gone, meaning the
    /// watchdog already fired; the caller should terminate it itself.
    pub fn set_handle(&self, id: &str, handle: BoundaryHandle) -> bool {
        match self.inner.entries.get_mut(id) {
            Some(mut entry) => {
                entry.boundary = Some(handle);
                true
            }
            None => false,
        }
    }

    /// Bind the live resource operation's cancel handle. Same contract as
    /// `set_handle`.
    pub fn set_resource_handle(&self, id: &str, handle: Arc<dyn CancelHandle>) -> bool {
        match self.inner.entries.get_mut(id) {
            Some(mut entry) => {
                entry.resource = Some(handle);
                true
            }
            None => false,
        }
    }

    /// Cancel the timer. Idempotent; true only if an entry was removed.
    pub fn unregister(&self, id: &str) -> bool {
        match self.inner.entries.remove(id) {
            Some((_, entry)) => {
                entry.timer.abort();
                self.inner.unregistered.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drain the registry, killing every bound handle. Terminal records are
    /// left to the supervisors, which observe the kill.
    pub fn kill_all(&self) -> usize {
        let ids: Vec<ExecutionId> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        let mut killed = 0;
        for id in ids {
            if let Some((_, entry)) = self.inner.entries.remove(&id) {
                entry.timer.abort();
                entry.kill();
                killed += 1;
            }
        }
        self.inner
            .killed_on_shutdown
            .fetch_add(killed as u64, Ordering::Relaxed);
        if killed > 0 {
            warn!(killed, "watchdog killed all live executions");
        }
        killed
    }

    pub fn active(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.entries.contains_key(id)
    }

    pub fn stats(&self) -> WatchdogStats {
        WatchdogStats {
            registered: self.inner.registered.load(Ordering::Relaxed),
            unregistered: self.inner.unregistered.load(Ordering::Relaxed),
            fired: self.inner.fired.load(Ordering::Relaxed),
            killed_on_shutdown: self.inner.killed_on_shutdown.load(Ordering::Relaxed),
        }
    }
}
