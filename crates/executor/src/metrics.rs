//! Execution counters, exposed in Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sluice_core::{ExecutionStatus, FailureKind, TimeoutSource};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge that remembers its high-water mark.
#[derive(Debug, Default)]
pub struct PeakGauge {
    current: AtomicU64,
    peak: AtomicU64,
}

impl PeakGauge {
    pub fn inc(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn dec(&self) {
        // never wrap below zero
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub started: Counter,
    pub completed: Counter,
    pub failed: Counter,
    pub timed_out: Counter,
    pub watchdog_killed: Counter,
    pub reaper_killed: Counter,
    pub concurrency: PeakGauge,
    duration_sum_ms: AtomicU64,
    duration_count: AtomicU64,
    duration_max_ms: AtomicU64,
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub watchdog_killed: u64,
    pub reaper_killed: u64,
    pub current_concurrency: u64,
    pub peak_concurrency: u64,
    pub average_duration_ms: f64,
    pub max_duration_ms: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot was granted and the `RUNNING` record written.
    pub fn execution_started(&self) {
        self.started.inc();
        self.concurrency.inc();
    }

    /// The execution's cleanup ran.
    pub fn execution_ended(&self) {
        self.concurrency.dec();
    }

    /// Count a terminal write. Call only from the writer that won it.
    pub fn record_terminal(&self, status: &ExecutionStatus, duration_ms: Option<u64>) {
        match status {
            ExecutionStatus::Running => return,
            ExecutionStatus::Success => self.completed.inc(),
            ExecutionStatus::Failed(kind) => {
                self.failed.inc();
                if let FailureKind::Timeout(source) = kind {
                    self.timed_out.inc();
                    match source {
                        TimeoutSource::Watchdog => self.watchdog_killed.inc(),
                        TimeoutSource::Reaper => self.reaper_killed.inc(),
                        TimeoutSource::Cooperative => {}
                    }
                }
            }
        }
        if let Some(ms) = duration_ms {
            self.duration_sum_ms.fetch_add(ms, Ordering::Relaxed);
            self.duration_count.fetch_add(1, Ordering::Relaxed);
            self.duration_max_ms.fetch_max(ms, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.duration_count.load(Ordering::Relaxed);
        let sum = self.duration_sum_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            started: self.started.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            timed_out: self.timed_out.get(),
            watchdog_killed: self.watchdog_killed.get(),
            reaper_killed: self.reaper_killed.get(),
            current_concurrency: self.concurrency.get(),
            peak_concurrency: self.concurrency.peak(),
            average_duration_ms: if count == 0 {
                0.0
            } else {
                sum as f64 / count as f64
            },
            max_duration_ms: self.duration_max_ms.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP sluice_{name} {help}");
            let _ = writeln!(out, "# TYPE sluice_{name} counter");
            let _ = writeln!(out, "sluice_{name} {value}");
        };
        counter(&mut out, "executions_started_total", "Executions granted a slot", s.started);
        counter(&mut out, "executions_completed_total", "Executions ending SUCCESS", s.completed);
        counter(&mut out, "executions_failed_total", "Executions ending FAILED", s.failed);
        counter(&mut out, "executions_timed_out_total", "Executions ending FAILED(timeout)", s.timed_out);
        counter(&mut out, "executions_watchdog_killed_total", "Executions killed by the watchdog", s.watchdog_killed);
        counter(&mut out, "executions_reaper_killed_total", "Executions failed by the reaper", s.reaper_killed);

        let _ = writeln!(out, "# HELP sluice_executions_active Executions currently holding a slot");
        let _ = writeln!(out, "# TYPE sluice_executions_active gauge");
        let _ = writeln!(out, "sluice_executions_active {}", s.current_concurrency);
        let _ = writeln!(out, "# HELP sluice_executions_active_peak Highest concurrent executions observed");
        let _ = writeln!(out, "# TYPE sluice_executions_active_peak gauge");
        let _ = writeln!(out, "sluice_executions_active_peak {}", s.peak_concurrency);

        let _ = writeln!(out, "# HELP sluice_execution_duration_seconds Execution duration");
        let _ = writeln!(out, "# TYPE sluice_execution_duration_seconds summary");
        let _ = writeln!(
            out,
            "sluice_execution_duration_seconds_sum {}",
            self.duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0
        );
        let _ = writeln!(
            out,
            "sluice_execution_duration_seconds_count {}",
            self.duration_count.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "# HELP sluice_execution_duration_max_seconds Longest execution");
        let _ = writeln!(out, "# TYPE sluice_execution_duration_max_seconds gauge");
        let _ = writeln!(
            out,
            "sluice_execution_duration_max_seconds {}",
            s.max_duration_ms as f64 / 1000.0
        );
        out
    }
}
