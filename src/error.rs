use std::time::Duration;

use thiserror::Error;

/// Failures of the raw counter collaborator for one poll cycle.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Interface enumeration failed: {0}")]
    Enumeration(String),
    #[error("Counter read timed out after {0:?}")]
    Timeout(Duration),
    #[error("Counter read task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No usable location for the history database")]
    NoDataDir,
    #[error("History store is unavailable")]
    Unavailable,
    #[error("Byte count {0} does not fit the storage column")]
    Overflow(u64),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
