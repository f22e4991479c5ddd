use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::ConfigError;
use crate::units::SpeedUnit;

pub const DEFAULT_CONFIG_PATH: &str = "netmeter.toml";

pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 2000;
pub const MIN_UPDATE_INTERVAL_MS: u64 = 100;
pub const DEFAULT_COLLECTOR_TIMEOUT_MS: u64 = 5000;
pub const MAX_AUTO_TRIM_DAYS: u32 = 365;
pub const DEFAULT_WRITER_QUEUE_CAPACITY: usize = 256;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub update_interval_ms: u64,
    /// Interface whose totals are recorded. Unset or empty records the
    /// aggregate of all monitored interfaces.
    pub selected_interface: Option<String>,
    pub collector_timeout_ms: u64,
    pub display_unit: SpeedUnit,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Days of history kept on startup and once a day while running. 0 keeps
    /// everything.
    pub auto_trim_days: u32,
    pub database_path: Option<PathBuf>,
    pub background_writer: bool,
    pub writer_queue_capacity: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub debug: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            selected_interface: None,
            collector_timeout_ms: DEFAULT_COLLECTOR_TIMEOUT_MS,
            display_unit: SpeedUnit::default(),
            history: HistoryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_trim_days: 0,
            database_path: None,
            background_writer: false,
            writer_queue_capacity: DEFAULT_WRITER_QUEUE_CAPACITY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            debug: false,
        }
    }
}

impl MonitorConfig {
    /// Clamps out-of-range values into their valid ranges.
    pub fn normalized(mut self) -> Self {
        self.update_interval_ms = self.update_interval_ms.max(MIN_UPDATE_INTERVAL_MS);
        self.collector_timeout_ms = self.collector_timeout_ms.max(MIN_UPDATE_INTERVAL_MS);
        self.history.auto_trim_days = self.history.auto_trim_days.min(MAX_AUTO_TRIM_DAYS);
        self.history.writer_queue_capacity = self.history.writer_queue_capacity.max(1);
        if self
            .selected_interface
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            self.selected_interface = None;
        }
        self
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms)
    }

    pub fn selected_interface(&self) -> Option<&str> {
        self.selected_interface.as_deref().filter(|s| !s.is_empty())
    }
}

/// Reads the config at `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<MonitorConfig, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file found, using defaults.");
            return Ok(MonitorConfig::default());
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read config file.");
            return Err(e.into());
        }
    };

    let config: MonitorConfig = toml::from_str(&content).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to parse config file.");
        e
    })?;

    info!(config = ?config, "Loaded config successfully.");
    Ok(config.normalized())
}

pub fn save_config(config: &MonitorConfig, path: &Path) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    info!(path = %path.display(), "Saved configuration.");
    Ok(())
}
