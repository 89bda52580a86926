//! Sluice Executor
//!
//! Runs approved database scripts inside the sandbox boundary, one
//! supervised execution per request:
//!
//! 1. The admission gate grants a slot (global and per-submitter limits,
//!    bounded FIFO queue) or rejects synchronously.
//! 2. The supervisor writes a `RUNNING` record, arms the watchdog, opens a
//!    tagged driver session and starts the boundary.
//! 3. Every resource call the script makes crosses the proxy channel and is
//!    resolved here against the session.
//! 4. Exactly one terminal record is written: by the supervisor, the
//!    watchdog, or the reaper, whichever gets there first.

pub mod config;
pub mod gate;
pub mod metrics;
mod proxy;
pub mod reaper;
pub mod service;
pub mod supervisor;
pub mod watchdog;

pub use config::{ConfigError, ExecutorConfig, ProxyLimits};
pub use gate::{AdmissionGate, ExecutionSlot, GateLimits};
pub use metrics::{Metrics, MetricsSnapshot};
pub use reaper::{ReapReport, Reaper};
pub use service::{ExecutorService, ServiceError, ServiceStatus};
pub use supervisor::{Supervisor, SupervisorError};
pub use watchdog::{Watchdog, WatchdogStats};
