//! Configuration for fleetsync hosts.
//!
//! One TOML file (platform config dir, or an explicit path) merged with
//! `FLEETSYNC_*` environment variables, validated and translated into
//! `fleetsync_core::ManagerConfig`. The [`logging`] module turns the
//! `[logging]` table into a tracing subscriber.

pub mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetsync_core::{FirmwareLevel, ManagerConfig};

pub use logging::{LogFormat, LoggingSettings, init_tracing};

const ENV_PREFIX: &str = "FLEETSYNC_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// `[manager]` table. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub max_synch_retry_count: u32,
    pub max_domain_versions: usize,
    pub max_firmware_versions: usize,
    pub task_queue_capacity: usize,
    pub reorder_window_secs: u64,
    /// Zero disables the heartbeat timer.
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Zero disables the synchronization timer.
    pub domain_sync_interval_secs: u64,
    pub quiesce_poll_interval_secs: u64,
    pub default_quiesce_timeout_secs: u64,
    pub firmware_deploy_timeout_secs: u64,
    pub firmware_poll_interval_secs: u64,
    pub notification_callback: String,
    pub min_firmware_for_quiesce: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        let core = ManagerConfig::default();
        Self {
            max_synch_retry_count: core.max_synch_retry_count,
            max_domain_versions: core.max_domain_versions,
            max_firmware_versions: core.max_firmware_versions,
            task_queue_capacity: core.task_queue_capacity,
            reorder_window_secs: core.reorder_window.as_secs(),
            heartbeat_interval_secs: core.heartbeat_interval.as_secs(),
            heartbeat_timeout_secs: core.heartbeat_timeout.as_secs(),
            domain_sync_interval_secs: core.domain_sync_interval.as_secs(),
            quiesce_poll_interval_secs: core.quiesce_poll_interval.as_secs(),
            default_quiesce_timeout_secs: core.default_quiesce_timeout.as_secs(),
            firmware_deploy_timeout_secs: core.firmware_deploy_timeout.as_secs(),
            firmware_poll_interval_secs: core.firmware_poll_interval.as_secs(),
            notification_callback: core.notification_callback,
            min_firmware_for_quiesce: core.min_firmware_for_quiesce,
        }
    }
}

impl ManagerSettings {
    /// Validate and translate into the core configuration.
    pub fn to_manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        let positive = [
            ("max_synch_retry_count", u64::from(self.max_synch_retry_count)),
            ("max_domain_versions", self.max_domain_versions as u64),
            ("max_firmware_versions", self.max_firmware_versions as u64),
            ("task_queue_capacity", self.task_queue_capacity as u64),
            ("reorder_window_secs", self.reorder_window_secs),
            ("heartbeat_timeout_secs", self.heartbeat_timeout_secs),
            ("quiesce_poll_interval_secs", self.quiesce_poll_interval_secs),
            ("firmware_deploy_timeout_secs", self.firmware_deploy_timeout_secs),
            ("firmware_poll_interval_secs", self.firmware_poll_interval_secs),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(invalid(field, "must be greater than zero"));
        }

        url::Url::parse(&self.notification_callback)
            .map_err(|e| invalid("notification_callback", format!("{e}")))?;
        self.min_firmware_for_quiesce
            .parse::<FirmwareLevel>()
            .map_err(|e| invalid("min_firmware_for_quiesce", e.to_string()))?;

        Ok(ManagerConfig {
            max_synch_retry_count: self.max_synch_retry_count,
            max_domain_versions: self.max_domain_versions,
            max_firmware_versions: self.max_firmware_versions,
            task_queue_capacity: self.task_queue_capacity,
            reorder_window: Duration::from_secs(self.reorder_window_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            domain_sync_interval: Duration::from_secs(self.domain_sync_interval_secs),
            quiesce_poll_interval: Duration::from_secs(self.quiesce_poll_interval_secs),
            default_quiesce_timeout: Duration::from_secs(self.default_quiesce_timeout_secs),
            firmware_deploy_timeout: Duration::from_secs(self.firmware_deploy_timeout_secs),
            firmware_poll_interval: Duration::from_secs(self.firmware_poll_interval_secs),
            notification_callback: self.notification_callback.clone(),
            min_firmware_for_quiesce: self.min_firmware_for_quiesce.clone(),
        })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "fleetsync", "fleetsync").map_or_else(
        || PathBuf::from("fleetsync.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the platform config file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file + environment. A missing file yields the
/// defaults overlaid with the environment.
///
/// Environment keys use `__` between table and field, e.g.
/// `FLEETSYNC_MANAGER__TASK_QUEUE_CAPACITY=128`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
