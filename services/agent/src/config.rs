//! Configuration for the converge agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use converge_reconcile::{InstallerConfig, DEFAULT_MAX_RETRIES};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for spilled resource content.
    pub data_dir: PathBuf,

    /// SQLite database holding the resource table.
    pub state_db: PathBuf,

    /// Pause after each cycle that executed tasks, in milliseconds.
    pub cycle_delay_ms: u64,

    /// Pause after a failed cycle, in milliseconds.
    pub error_backoff_ms: u64,

    /// Retries a task gets before it gives up.
    pub max_task_retries: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = InstallerConfig::default();

        let data_dir = lookup("CONVERGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        // Database lives in the data directory unless placed elsewhere
        let state_db = lookup("CONVERGE_STATE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("installer.db"));

        let cycle_delay_ms = lookup("CONVERGE_CYCLE_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cycle_delay.as_millis() as u64);

        let error_backoff_ms = lookup("CONVERGE_ERROR_BACKOFF_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.error_backoff.as_millis() as u64);

        let max_task_retries = lookup("CONVERGE_MAX_TASK_RETRIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let log_level = lookup("CONVERGE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            data_dir,
            state_db,
            cycle_delay_ms,
            error_backoff_ms,
            max_task_retries,
            log_level,
        })
    }

    /// Settings for the installer worker.
    pub fn installer_config(&self) -> InstallerConfig {
        InstallerConfig {
            cycle_delay: Duration::from_millis(self.cycle_delay_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            data_dir: self.data_dir.clone(),
        }
    }
}
