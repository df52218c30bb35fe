//! # Ingest Configuration
//!
//! Defaults, optionally overridden by a JSON file and then by `CTMAP_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_WORKERS: &str = "CTMAP_WORKERS";
pub const ENV_MULTI_INSERT_SIZE: &str = "CTMAP_MULTI_INSERT_SIZE";
pub const ENV_STATS_MS: &str = "CTMAP_STATS_MS";
pub const ENV_DB_PATH: &str = "CTMAP_DB_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{var}={value:?} is not a valid number")]
    Env { var: &'static str, value: String },

    #[error("{0} must be positive")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Certificate workers, and as many domain workers.
    pub worker_count: usize,
    /// Rows per bulk write.
    pub multi_insert_size: usize,
    /// Statistics report interval; zero disables the reports.
    pub stats_update_freq_ms: u64,
    pub db_path: PathBuf,
    /// Skip certificates already written during this process.
    pub presence_cache: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            worker_count: 32,
            multi_insert_size: 10_000,
            stats_update_freq_ms: 1_000,
            db_path: PathBuf::from(".ctmap/map.db"),
            presence_cache: true,
        }
    }
}

impl IngestConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply the `CTMAP_*` variables present in the environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|var| std::env::var(var).ok())
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = get(ENV_WORKERS) {
            self.worker_count = parse_var(ENV_WORKERS, v)?;
        }
        if let Some(v) = get(ENV_MULTI_INSERT_SIZE) {
            self.multi_insert_size = parse_var(ENV_MULTI_INSERT_SIZE, v)?;
        }
        if let Some(v) = get(ENV_STATS_MS) {
            self.stats_update_freq_ms = parse_var(ENV_STATS_MS, v)?;
        }
        if let Some(v) = get(ENV_DB_PATH) {
            self.db_path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Zero("worker_count"));
        }
        if self.multi_insert_size == 0 {
            return Err(ConfigError::Zero("multi_insert_size"));
        }
        Ok(())
    }

    pub fn stats_update_freq(&self) -> Duration {
        Duration::from_millis(self.stats_update_freq_ms)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}
