//! Platform-aware config and data directories.

use std::path::PathBuf;

/// Default config directory for a service.
///
/// - macOS: `~/Library/Application Support/{Service}`
/// - Linux: `$XDG_CONFIG_HOME/{service}` or `~/.config/{service}`
/// - Windows: `%APPDATA%\{Service}`
pub fn default_config_dir_for(service: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        xdg_dir("XDG_CONFIG_HOME", &[".config"]).join(service.to_lowercase())
    }
    #[cfg(not(target_os = "linux"))]
    {
        platform_dir(service)
    }
}

/// Default data directory for a service: where the record database and the
/// relational driver's database files live unless configured otherwise.
///
/// - Linux: `$XDG_DATA_HOME/{service}` or `~/.local/share/{service}`
/// - elsewhere: same as the config directory
pub fn default_data_dir_for(service: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        xdg_dir("XDG_DATA_HOME", &[".local", "share"]).join(service.to_lowercase())
    }
    #[cfg(not(target_os = "linux"))]
    {
        platform_dir(service)
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if path == "~" => home_dir(),
        None => PathBuf::from(path),
    }
}

#[cfg(target_os = "linux")]
fn xdg_dir(var: &str, fallback: &[&str]) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| fallback.iter().fold(home_dir(), |acc, part| acc.join(part)))
}

#[cfg(not(target_os = "linux"))]
fn platform_dir(service: &str) -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home_dir()
            .join("Library")
            .join("Application Support")
            .join(capitalize(service))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join("AppData").join("Roaming"))
            .join(capitalize(service))
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        home_dir().join(format!(".{}", service.to_lowercase()))
    }
}

fn home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => c.to_uppercase().to_string() + &chars.as_str().to_lowercase(),
    }
}
