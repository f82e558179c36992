//! Configuration for the supervisor: tool location, delivery endpoints and tuning knobs.
//!
//! # Settings Management
//!
//! `SettingsManager` loads `SupervisorConfig` from a JSON file:
//! - a missing file yields defaults
//! - an unparsable file logs a warning and yields defaults
//! - `save` writes pretty JSON, creating parent directories

pub mod profiles;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use profiles::TestProfile;

/// Supervisor configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    // External tool
    pub tool_path: String,
    /// Arguments placed before every invocation (wrapper scripts, global flags)
    pub tool_args: Vec<String>,
    pub tcti: String,
    pub image_tag: String,
    /// Tool versions older than this need the explicit category flag
    pub modern_dialect_since: String,

    // Run layout
    pub work_dir: PathBuf,
    pub profile: TestProfile,

    // Store-to-volume
    pub result_mount_point: PathBuf,
    pub result_volume_label: String,

    // Upload
    pub upload_endpoint: String,
    pub depository_id: u32,
    pub user_agent: String,

    // Connectivity probe
    pub connectivity_url: String,
    pub connectivity_timeout_secs: u64,

    // Worker tuning
    pub idle_recheck_ms: u64,
    pub log_capacity: usize,
    pub display_log_lines: usize,

    /// Leading rows excluded from statistics, keyed by command name
    pub warmup_rows: BTreeMap<String, usize>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let mut warmup_rows = BTreeMap::new();
        warmup_rows.insert("EncryptDecrypt".to_string(), 1);

        SupervisorConfig {
            tool_path: "tpm2_algtest".to_string(),
            tool_args: Vec::new(),
            tcti: "device:/dev/tpm0".to_string(),
            image_tag: format!("algtest-supervisor {}", crate::VERSION),
            modern_dialect_since: "0.6.0".to_string(),
            work_dir: std::env::temp_dir(),
            profile: TestProfile::Basic,
            result_mount_point: PathBuf::from("/mnt/algtest"),
            result_volume_label: "ALGTEST_RES".to_string(),
            upload_endpoint: "https://is.muni.cz/dok/depository_in".to_string(),
            depository_id: 4085,
            user_agent: "tpm2-algtest-ui".to_string(),
            connectivity_url: "http://google.com".to_string(),
            connectivity_timeout_secs: 2,
            idle_recheck_ms: 50,
            log_capacity: 10_000,
            display_log_lines: 400,
            warmup_rows,
        }
    }
}

impl SupervisorConfig {
    pub fn idle_recheck(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_ms)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity_timeout_secs)
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool_path.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "tool_path cannot be empty".to_string(),
            ));
        }
        if self.log_capacity == 0 || self.display_log_lines == 0 {
            return Err(ConfigError::ValidationFailed(
                "log_capacity and display_log_lines must be positive".to_string(),
            ));
        }
        if self.idle_recheck_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "idle_recheck_ms must be positive".to_string(),
            ));
        }
        if crate::orchestrator::dialect::ToolVersion::parse(&self.modern_dialect_since).is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "modern_dialect_since is not a version: {}",
                self.modern_dialect_since
            )));
        }
        Ok(())
    }
}

/// Default settings path: ~/.config/algtest-supervisor/settings.json
pub fn get_global_settings_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine config directory".to_string())
    })?;
    Ok(config_dir.join("algtest-supervisor").join("settings.json"))
}

/// JSON persistence for `SupervisorConfig`
pub struct SettingsManager;

impl SettingsManager {
    /// Load settings, falling back to defaults when absent or unreadable.
    pub fn load(path: &Path) -> Result<SupervisorConfig, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<SupervisorConfig>(&content) {
                Ok(config) => {
                    config.validate()?;
                    Ok(config)
                }
                Err(e) => {
                    log::warn!(
                        "[Config] Failed to parse {}, falling back to defaults: {}",
                        path.display(),
                        e
                    );
                    Ok(SupervisorConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("[Config] {} not found, using defaults", path.display());
                Ok(SupervisorConfig::default())
            }
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Load settings that must exist (explicit `--config` on the command line).
    pub fn load_required(path: &Path) -> Result<SupervisorConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: SupervisorConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(config: &SupervisorConfig, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
