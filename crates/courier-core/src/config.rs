//! Bus configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_*)
//! - TOML configuration file

use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::store::DEFAULT_STORE_CAPACITY;
use crate::subscription::{CursorForm, DEFAULT_MAX_MESSAGES};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default config file locations, searched in order by [`BusConfig::load`].
pub const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages retained per topic.
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,

    /// Upper bound on concurrently alive workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Idle workers tolerated before extras retire. Capped at `max_workers`.
    #[serde(default = "default_max_idle_workers")]
    pub max_idle_workers: usize,

    /// Interval between liveness sweeps in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Default per-topic batch size for new subscriptions.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Cursor token form handed to handlers.
    #[serde(default)]
    pub cursor_form: CursorForm,
}

fn parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// Default value functions
fn default_store_capacity() -> usize {
    env_usize("COURIER_STORE_CAPACITY").unwrap_or(DEFAULT_STORE_CAPACITY)
}

fn default_max_workers() -> usize {
    env_usize("COURIER_MAX_WORKERS").unwrap_or_else(|| 3 * parallelism())
}

fn default_max_idle_workers() -> usize {
    env_usize("COURIER_MAX_IDLE_WORKERS")
        .unwrap_or_else(|| parallelism().min(default_max_workers()))
}

fn default_sweep_interval_ms() -> u64 {
    std::env::var("COURIER_SWEEP_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5_000) // 5 seconds
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            store_capacity: default_store_capacity(),
            max_workers: default_max_workers(),
            max_idle_workers: default_max_idle_workers(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_messages: default_max_messages(),
            cursor_form: CursorForm::default(),
        }
    }
}

impl BusConfig {
    /// Load configuration from the first default path that exists, or
    /// defaults with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read, parsed
    /// or validated.
    pub fn load() -> Result<Self, ConfigError> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                info!(path = %expanded, "Loading bus config");
                return Self::from_file(expanded.as_ref());
            }
        }

        debug!("No config file found, using defaults");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: BusConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "store_capacity",
                reason: "must be at least 1",
            });
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_workers",
                reason: "must be at least 1",
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "sweep_interval_ms",
                reason: "must be at least 1",
            });
        }
        if self.max_messages == 0 {
            return Err(ConfigError::Invalid {
                field: "max_messages",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// The worker-pool part of this configuration.
    ///
    /// `max_idle_workers` is capped at `max_workers`.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_workers: self.max_workers,
            max_idle_workers: self.max_idle_workers.min(self.max_workers),
            sweep_interval: self.sweep_interval(),
        }
    }
}
