//! Periodic reconciliation of records and driver sessions the watchdog and
//! the cooperative timeout both missed, e.g. after a crash mid-kill.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sluice_core::{now_millis, ExecError, TerminalUpdate, TimeoutSource, SUBSYSTEM_TAG};
use sluice_drivers::DriverRegistry;
use sluice_store::{RecordStore, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Stuck `RUNNING` records failed by this sweep.
    pub records_failed: usize,
    /// Sessions terminated because their record was stuck.
    pub sessions_terminated: usize,
    /// Tagged sessions past the threshold with no stuck record behind them.
    pub orphan_sessions: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reaper {
    store: Arc<dyn RecordStore>,
    drivers: DriverRegistry,
    metrics: Arc<Metrics>,
    stale_after: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn RecordStore>,
        drivers: DriverRegistry,
        metrics: Arc<Metrics>,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            drivers,
            metrics,
            stale_after,
            interval,
        }
    }

    /// One pass. Idempotent against already-terminal records and sessions
    /// that are already gone.
    pub fn sweep_once(&self) -> Result<ReapReport, StoreError> {
        let now = now_millis();
        let cutoff = now - self.stale_after.as_millis() as i64;
        let mut report = ReapReport::default();

        for record in self.store.stale_running(cutoff)? {
            for driver in self.drivers.all() {
                for session in driver.sessions(SUBSYSTEM_TAG) {
                    if session.tag.execution_id == record.id
                        && driver.terminate_session(session.session_id)
                    {
                        report.sessions_terminated += 1;
                    }
                }
            }

            let update = TerminalUpdate::failure(&ExecError::Timeout(TimeoutSource::Reaper), now);
            if self.store.finish(&record.id, &update)? {
                report.records_failed += 1;
                let duration = (now - record.started_at).max(0) as u64;
                self.metrics.record_terminal(&update.status, Some(duration));
                warn!(execution_id = %record.id, started_at = record.started_at, "reaper failed stuck execution");
            }
        }

        for driver in self.drivers.all() {
            for session in driver.sessions(SUBSYSTEM_TAG) {
                if session.opened_at < cutoff && driver.terminate_session(session.session_id) {
                    report.orphan_sessions += 1;
                    warn!(
                        engine = driver.name(),
                        session_id = session.session_id,
                        execution_id = %session.tag.execution_id,
                        "reaper terminated orphaned session"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Sweep every interval until `shutdown` flips to true or its sender is
    /// dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "reaper starting");
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.sweep_once() {
                        Ok(report) if report.is_empty() => debug!("reaper sweep clean"),
                        Ok(report) => info!(?report, "reaper sweep"),
                        Err(e) => error!(error = %e, "reaper sweep failed"),
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{CodecLimits, ExecutionRecord, ExecutionRequest, ExecutionStatus, FailureKind};
    use sluice_drivers::{DocumentDriver, ResourceDriver, SessionTag};
    use sluice_store::SqliteRecordStore;

    fn request(id: &str) -> ExecutionRequest {
        ExecutionRequest {
            id: id.into(),
            source_text: String::new(),
            target_engine: "document".into(),
            target_database: "app".into(),
            submitter_id: "alice".into(),
            time_budget_ms: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_fails_stuck_records_and_sessions() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let driver = Arc::new(DocumentDriver::new());
        driver.create_database("app");
        let drivers = DriverRegistry::new().with(driver.clone());
        let metrics = Arc::new(Metrics::new());

        let long_ago = now_millis() - 10 * 60 * 1000;
        store
            .insert_running(&ExecutionRecord::running(&request("stuck"), long_ago))
            .unwrap();
        store
            .insert_running(&ExecutionRecord::running(&request("live"), now_millis()))
            .unwrap();
        let _stuck_session = driver
            .open("app", SessionTag::new(SUBSYSTEM_TAG, "stuck"), CodecLimits::default())
            .await
            .unwrap();
        let _live_session = driver
            .open("app", SessionTag::new(SUBSYSTEM_TAG, "live"), CodecLimits::default())
            .await
            .unwrap();

        let reaper = Reaper::new(
            store.clone(),
            drivers,
            metrics.clone(),
            Duration::from_secs(90),
            Duration::from_secs(30),
        );
        let report = reaper.sweep_once().unwrap();
        assert_eq!(report.records_failed, 1);
        assert_eq!(report.sessions_terminated, 1);
        assert_eq!(report.orphan_sessions, 0);

        assert_eq!(
            store.get("stuck").unwrap().unwrap().status,
            ExecutionStatus::Failed(FailureKind::Timeout(TimeoutSource::Reaper))
        );
        assert_eq!(store.get("live").unwrap().unwrap().status, ExecutionStatus::Running);
        assert_eq!(driver.sessions(SUBSYSTEM_TAG).len(), 1);
        assert_eq!(metrics.snapshot().reaper_killed, 1);

        // second pass has nothing left to do
        assert!(reaper.sweep_once().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_sessions_past_threshold() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let driver = Arc::new(DocumentDriver::new());
        driver.create_database("app");
        let _orphan = driver
            .open("app", SessionTag::new(SUBSYSTEM_TAG, "ghost"), CodecLimits::default())
            .await
            .unwrap();
        let _foreign = driver
            .open("app", SessionTag::new("reporting", "other"), CodecLimits::default())
            .await
            .unwrap();

        // zero threshold: every tagged session is already stale
        let reaper = Reaper::new(
            store,
            DriverRegistry::new().with(driver.clone()),
            Arc::new(Metrics::new()),
            Duration::ZERO,
            Duration::from_secs(30),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = reaper.sweep_once().unwrap();
        assert_eq!(report.orphan_sessions, 1);
        assert!(driver.sessions(SUBSYSTEM_TAG).is_empty());
        assert_eq!(driver.sessions("reporting").len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        let reaper = Arc::new(Reaper::new(
            Arc::new(SqliteRecordStore::open_in_memory().unwrap()),
            DriverRegistry::new(),
            Arc::new(Metrics::new()),
            Duration::from_secs(90),
            Duration::from_millis(10),
        ));
        let (tx, rx) = watch::channel(false);
        let task = reaper.spawn(rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
