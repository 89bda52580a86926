//! Executor configuration, persisted through `sluice_settings::Settings`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_core::CodecLimits;
use sluice_sandbox::SandboxLimits;
use sluice_settings::Validate;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid executor config: {0}")]
    Invalid(String),
}

/// Limits on traffic through the resource proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyLimits {
    /// Resource calls allowed per execution.
    pub max_calls: u32,
    /// Nesting ceiling for any value crossing the boundary.
    pub max_depth: usize,
    /// Byte ceiling for any encoded value crossing the boundary.
    pub max_bytes: usize,
}

impl Default for ProxyLimits {
    fn default() -> Self {
        let codec = CodecLimits::default();
        Self {
            max_calls: 100,
            max_depth: codec.max_depth,
            max_bytes: codec.max_bytes,
        }
    }
}

impl ProxyLimits {
    pub fn codec(&self) -> CodecLimits {
        CodecLimits {
            max_depth: self.max_depth,
            max_bytes: self.max_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Concurrent executions across all submitters.
    pub global_max: usize,
    /// Concurrent executions per submitter, queued ones included.
    pub per_submitter_max: usize,
    /// Requests allowed to wait for a slot.
    pub queue_capacity: usize,
    /// Longest a queued request waits before it is rejected. 0 waits forever.
    pub queue_timeout_ms: u64,
    pub default_time_budget_ms: u64,
    /// Requested budgets are clamped to this.
    pub max_time_budget_ms: u64,
    /// Added to the budget to get the watchdog timeout.
    pub watchdog_grace_ms: u64,
    pub reaper_interval_ms: u64,
    /// Age at which a `RUNNING` record or a tagged session counts as stuck.
    pub reaper_stale_after_ms: u64,
    /// Rows kept inline before the result is spilled.
    pub inline_row_limit: usize,
    pub sandbox: SandboxLimits,
    pub proxy: ProxyLimits,
    /// Directory holding `<name>.sqlite` databases. Defaults to
    /// `<data dir>/databases`.
    pub sqlite_root: Option<PathBuf>,
    /// Databases created in the in-process document engine at startup.
    pub document_databases: Vec<String>,
    /// Record database file. Defaults to `<data dir>/executions.sqlite`.
    pub record_db: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            global_max: 8,
            per_submitter_max: 3,
            queue_capacity: 32,
            queue_timeout_ms: 30_000,
            default_time_budget_ms: 10_000,
            max_time_budget_ms: 60_000,
            watchdog_grace_ms: 2_000,
            reaper_interval_ms: 30_000,
            reaper_stale_after_ms: 90_000,
            inline_row_limit: 1_000,
            sandbox: SandboxLimits::default(),
            proxy: ProxyLimits::default(),
            sqlite_root: None,
            document_databases: vec!["default".into()],
            record_db: None,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.global_max == 0 {
            return invalid("global_max must be positive");
        }
        if self.per_submitter_max == 0 {
            return invalid("per_submitter_max must be positive");
        }
        if self.default_time_budget_ms == 0 || self.max_time_budget_ms == 0 {
            return invalid("time budgets must be positive");
        }
        if self.default_time_budget_ms > self.max_time_budget_ms {
            return invalid("default_time_budget_ms exceeds max_time_budget_ms");
        }
        if self.reaper_interval_ms == 0 {
            return invalid("reaper_interval_ms must be positive");
        }
        match self.max_time_budget_ms.checked_add(self.watchdog_grace_ms) {
            None => return invalid("max_time_budget_ms + watchdog_grace_ms overflows"),
            Some(longest) if self.reaper_stale_after_ms <= longest => {
                return invalid(
                    "reaper_stale_after_ms must exceed max_time_budget_ms + watchdog_grace_ms",
                )
            }
            Some(_) => {}
        }
        if self.inline_row_limit == 0 {
            return invalid("inline_row_limit must be positive");
        }
        if self.proxy.max_calls == 0 || self.proxy.max_depth == 0 || self.proxy.max_bytes == 0 {
            return invalid("proxy limits must be positive");
        }
        self.sandbox.validate().map_err(ConfigError::Invalid)
    }

    /// Budget for a request: its own or the default, clamped to the maximum.
    pub fn time_budget(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_time_budget_ms)
            .clamp(1, self.max_time_budget_ms);
        Duration::from_millis(ms)
    }

    pub fn watchdog_timeout(&self, budget: Duration) -> Duration {
        budget.saturating_add(Duration::from_millis(self.watchdog_grace_ms))
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        (self.queue_timeout_ms > 0).then(|| Duration::from_millis(self.queue_timeout_ms))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.reaper_stale_after_ms)
    }
}

impl Validate for ExecutorConfig {
    fn validate(&self) -> Result<(), String> {
        ExecutorConfig::validate(self).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = ExecutorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.per_submitter_max, 3);
        assert_eq!(cfg.proxy.max_calls, 100);
    }

    #[test]
    fn test_reaper_threshold_must_exceed_watchdog() {
        let cfg = ExecutorConfig {
            max_time_budget_ms: 60_000,
            watchdog_grace_ms: 2_000,
            reaper_stale_after_ms: 62_000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_overflowing_budget_sum_is_rejected() {
        let cfg = ExecutorConfig {
            max_time_budget_ms: u64::MAX,
            default_time_budget_ms: 1_000,
            watchdog_grace_ms: 2,
            reaper_stale_after_ms: 1,
            ..Default::default()
        };
        match cfg.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("overflows")),
            other => panic!("expected overflow rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_time_budget_clamped() {
        let cfg = ExecutorConfig {
            default_time_budget_ms: 1_000,
            max_time_budget_ms: 5_000,
            reaper_stale_after_ms: 60_000,
            ..Default::default()
        };
        assert_eq!(cfg.time_budget(None), Duration::from_millis(1_000));
        assert_eq!(cfg.time_budget(Some(50_000)), Duration::from_millis(5_000));
        assert_eq!(cfg.time_budget(Some(0)), Duration::from_millis(1));
        assert_eq!(
            cfg.watchdog_timeout(Duration::from_millis(1_000)),
            Duration::from_millis(3_000)
        );
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: ExecutorConfig =
            serde_json::from_str(r#"{"global_max": 2, "proxy": {"max_calls": 5}}"#).unwrap();
        assert_eq!(cfg.global_max, 2);
        assert_eq!(cfg.proxy.max_calls, 5);
        assert_eq!(cfg.proxy.max_depth, 64);
        assert_eq!(cfg.queue_capacity, 32);
    }

    #[test]
    fn test_queue_timeout_zero_disables() {
        let cfg = ExecutorConfig {
            queue_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(cfg.queue_timeout(), None);
    }
}
