//! Where cifarm looks for its own files on the controller machine.

use std::path::PathBuf;

/// Directory holding `settings.json`.
///
/// Resolution order:
/// 1. `CIFARM_CONFIG_DIR` environment variable
/// 2. the platform config directory (`~/.config/cifarm` on Linux)
/// 3. `.cifarm` in the working directory
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CIFARM_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir().map(|d| d.join("cifarm")).unwrap_or_else(|| PathBuf::from(".cifarm"))
}

/// Default settings file.
pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

/// Default directory of docker build contexts and templates.
///
/// `CIFARM_ASSETS_DIR` wins, otherwise `assets` relative to the working directory.
pub fn default_assets_dir() -> PathBuf {
    std::env::var("CIFARM_ASSETS_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("assets"))
}
