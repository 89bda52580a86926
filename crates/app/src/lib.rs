//! Sluice App
//!
//! Daemon initialization: logging, settings, the executor service behind it,
//! and the IPC handler that exposes it.

pub mod daemon;
pub mod handler;

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use sluice_logging::LogLevel;
use sluice_settings::{Settings, SettingsError, Validate};
use thiserror::Error;
use tracing::info;

pub use daemon::build_service;
pub use handler::ExecutorHandler;

/// Service name used for settings, data directory and socket path.
pub const SERVICE: &str = "sluice";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("record store error: {0}")]
    Store(#[from] sluice_store::StoreError),
    #[error("executor error: {0}")]
    Service(#[from] sluice_executor::ServiceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initialized application context
pub struct App<T> {
    pub service: String,
    pub settings: Settings<T>,
}

/// Builder for constructing an App with configurable options.
pub struct AppBuilder<T> {
    service: String,
    log_level: LogLevel,
    skip_logging: bool,
    config_path: Option<PathBuf>,
    _phantom: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Default + Validate> AppBuilder<T> {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            log_level: LogLevel::Info,
            skip_logging: false,
            config_path: None,
            _phantom: PhantomData,
        }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.log_level = LogLevel::from_verbose(verbose);
        self
    }

    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    pub fn config_path(mut self, path: Option<&Path>) -> Self {
        self.config_path = path.map(Path::to_path_buf);
        self
    }

    pub fn build(self) -> Result<App<T>, AppError> {
        if !self.skip_logging {
            // a subscriber installed by an embedding process wins
            let _ = sluice_logging::try_init(self.log_level);
        }

        let settings = Settings::load_or_default(&self.service, self.config_path.as_deref())?;
        info!(
            service = %self.service,
            version = env!("CARGO_PKG_VERSION"),
            settings = %settings.path().display(),
            "starting"
        );

        Ok(App {
            service: self.service,
            settings,
        })
    }
}
