//! Tool settings.
//!
//! These tune how cifarm talks to the farm; the farm itself is described by
//! the config document in [`crate::config`].

use crate::error::{FarmError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent settings for cifarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// Docker build contexts, job template and Jenkins option files.
    pub assets_dir: PathBuf,
    /// Bridge network created on every container host.
    pub network_name: String,
    pub connect_timeout_secs: u64,
    /// Rebuild images that already exist on a host.
    pub rebuild_images: bool,
    pub jenkins_online_initial_delay_secs: u64,
    pub jenkins_online_poll_interval_secs: u64,
    pub jenkins_online_max_wait_secs: u64,
    /// Repository with the CPF Jenkinsfile; each job's own repository when unset.
    pub jenkinsjob_repository: Option<String>,
    pub jenkinsfile_tag_or_branch: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            assets_dir: paths::default_assets_dir(),
            network_name: "cifarm-network".to_string(),
            connect_timeout_secs: 10,
            rebuild_images: true,
            jenkins_online_initial_delay_secs: 10,
            jenkins_online_poll_interval_secs: 1,
            jenkins_online_max_wait_secs: 300,
            jenkinsjob_repository: None,
            jenkinsfile_tag_or_branch: "master".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (paths::settings_path(), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| FarmError::FileReadError {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| FarmError::InvalidSettings {
            reason: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    /// Save settings to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FarmError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            FarmError::InvalidSettings { reason: format!("Failed to serialize settings: {}", e) }
        })?;
        std::fs::write(path, content).map_err(|e| FarmError::io(path, e))
    }

    /// Build context of `image` (a directory holding its `Dockerfile`).
    pub fn image_context_dir(&self, image: &str) -> PathBuf {
        self.assets_dir.join("docker").join(image)
    }

    /// Files copied as-is into the master's home.
    pub fn jenkins_general_config_dir(&self) -> PathBuf {
        self.assets_dir.join("jenkins").join("general")
    }

    pub fn cpf_job_template(&self) -> PathBuf {
        self.assets_dir.join("jenkins").join("cpf-job-config.xml.in")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn online_initial_delay(&self) -> Duration {
        Duration::from_secs(self.jenkins_online_initial_delay_secs)
    }

    pub fn online_poll_interval(&self) -> Duration {
        Duration::from_secs(self.jenkins_online_poll_interval_secs.max(1))
    }

    pub fn online_max_wait(&self) -> Duration {
        Duration::from_secs(self.jenkins_online_max_wait_secs)
    }
}
