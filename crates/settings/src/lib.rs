//! Sluice Settings
//!
//! JSON config file management. A service defines its own config type and
//! wraps it in `Settings<T>`; a missing file is created from `T::default()`.
//!
//! ```ignore
//! let settings: Settings<ExecutorConfig> = Settings::load_or_default("sluice", None)?;
//! ```

pub mod paths;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

pub use paths::{default_config_dir_for, default_data_dir_for, expand_path};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Config types that can check their own invariants after loading.
pub trait Validate {
    fn validate(&self) -> std::result::Result<(), String>;
}

/// A loaded config together with the file it lives in.
pub struct Settings<T> {
    pub config: T,
    path: PathBuf,
}

impl<T: Serialize + DeserializeOwned + Default + Validate> Settings<T> {
    /// Load settings from `custom_path`, or the service's default location.
    /// Writes defaults when the file does not exist yet.
    pub fn load_or_default(service: &str, custom_path: Option<&Path>) -> Result<Self> {
        let path = match custom_path {
            Some(p) => p.to_path_buf(),
            None => default_settings_path(service),
        };

        let settings = if path.exists() {
            debug!(path = %path.display(), "loading settings");
            let content = fs::read_to_string(&path).map_err(|e| SettingsError::Read {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let config: T = serde_json::from_str(&content).map_err(|e| SettingsError::Parse {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            Self { config, path }
        } else {
            debug!(path = %path.display(), "writing default settings");
            let settings = Self {
                config: T::default(),
                path,
            };
            settings.save()?;
            settings
        };

        settings.config.validate().map_err(SettingsError::Invalid)?;
        Ok(settings)
    }

    /// Persist the current config as pretty JSON, creating parent directories.
    pub fn save(&self) -> Result<()> {
        let write_err = |reason: String| SettingsError::Write {
            path: self.path.clone(),
            reason,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(&self.config).map_err(|e| write_err(e.to_string()))?;
        fs::write(&self.path, content).map_err(|e| write_err(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `<config dir>/settings.json` for a service.
pub fn default_settings_path(service: &str) -> PathBuf {
    default_config_dir_for(service).join("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestConfig {
        workers: u32,
        label: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                workers: 2,
                label: "default".into(),
            }
        }
    }

    impl Validate for TestConfig {
        fn validate(&self) -> std::result::Result<(), String> {
            if self.workers == 0 {
                return Err("workers must be positive".into());
            }
            Ok(())
        }
    }

    #[test]
    fn test_creates_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings: Settings<TestConfig> =
            Settings::load_or_default("test", Some(&path)).unwrap();
        assert_eq!(settings.config, TestConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings: Settings<TestConfig> =
            Settings::load_or_default("test", Some(&path)).unwrap();
        settings.config.workers = 8;
        settings.config.label = "tuned".into();
        settings.save().unwrap();

        let loaded: Settings<TestConfig> = Settings::load_or_default("test", Some(&path)).unwrap();
        assert_eq!(loaded.config.workers, 8);
        assert_eq!(loaded.config.label, "tuned");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"workers": 0, "label": "x"}"#).unwrap();

        let result: Result<Settings<TestConfig>> = Settings::load_or_default("test", Some(&path));
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_parse_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let err = Settings::<TestConfig>::load_or_default("test", Some(&path))
            .err()
            .unwrap();
        assert!(err.to_string().contains("settings.json"));
    }
}
