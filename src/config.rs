/*!
 * Configuration structures and defaults for Hydrant
 */

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HydrantError, Result};

/// Number of connection slots in the pool. Fixed at compile time per the
/// core invariant that the pool array has fixed identity; unlike
/// `worker_count` or `heartbeat_interval_secs`, this cannot be made a
/// config field without risking a pool whose slot count changes out from
/// under the fixed-array invariants the rest of the system assumes.
pub const POOL_SIZE: usize = 10;

pub const CONNECTION_DEAD_THRESHOLD: u32 = 5;
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;
pub const MAX_BACKOFF_ATTEMPTS: u32 = 10;
pub const RECOVERY_BACKOFF_BASE_MS: u64 = 100;

pub const MAX_ERROR_LENGTH: usize = 1024;
pub const COPY_CHUNK_SIZE: usize = 8 * 1024;
pub const MIN_BATCH_SIZE: usize = 64 * 1024;
pub const DEFAULT_BATCH_SIZE: usize = 1024 * 1024;
pub const MAX_BATCH_SIZE: usize = 10 * 1024 * 1024;
pub const COPY_PUT_MAX_RETRIES: u32 = 5;
pub const BATCH_STATS_RING_LEN: usize = 1000;

const DEFAULT_WORKER_COUNT: usize = 2;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Immutable configuration, validated once at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub db_conn_string: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_require_ssl")]
    pub require_ssl: bool,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_require_ssl() -> bool {
    true
}
fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}
fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

impl Config {
    /// Load from a TOML file if `config_path` is given, otherwise from
    /// the environment (`HYDRANT_DB_URL`, `HYDRANT_BATCH_SIZE`).
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?,
        };
        config.clamp_batch_size();
        Ok(config)
    }

    fn from_env() -> Result<Self> {
        let db_conn_string = std::env::var("HYDRANT_DB_URL")
            .map_err(|_| HydrantError::Config("HYDRANT_DB_URL is required".into()))?;

        let batch_size = match std::env::var("HYDRANT_BATCH_SIZE") {
            Ok(raw) => raw
                .parse::<usize>()
                .map_err(|_| HydrantError::Config(format!("invalid HYDRANT_BATCH_SIZE: {raw}")))?,
            Err(_) => DEFAULT_BATCH_SIZE,
        };

        Ok(Self {
            db_conn_string,
            batch_size,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            require_ssl: default_require_ssl(),
            worker_count: default_worker_count(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        })
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| HydrantError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| HydrantError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Clamp `batch_size` into `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]`, logging
    /// a `WARN` event when the configured value was out of range.
    fn clamp_batch_size(&mut self) {
        if self.batch_size < MIN_BATCH_SIZE {
            crate::log_event!(
                crate::events::Level::Warn,
                "batch size {} below minimum, using {}",
                self.batch_size,
                MIN_BATCH_SIZE
            );
            self.batch_size = MIN_BATCH_SIZE;
        } else if self.batch_size > MAX_BATCH_SIZE {
            crate::log_event!(
                crate::events::Level::Warn,
                "batch size {} above maximum, using {}",
                self.batch_size,
                MAX_BATCH_SIZE
            );
            self.batch_size = MAX_BATCH_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_batch_size_below_minimum() {
        let mut config = Config {
            db_conn_string: "postgres://x".into(),
            batch_size: 1024,
            max_retries: 3,
            retry_delay_ms: 100,
            require_ssl: false,
            worker_count: 2,
            heartbeat_interval_secs: 60,
        };
        config.clamp_batch_size();
        assert_eq!(config.batch_size, MIN_BATCH_SIZE);
    }

    #[test]
    fn clamps_batch_size_above_maximum() {
        let mut config = Config {
            db_conn_string: "postgres://x".into(),
            batch_size: MAX_BATCH_SIZE + 1,
            max_retries: 3,
            retry_delay_ms: 100,
            require_ssl: false,
            worker_count: 2,
            heartbeat_interval_secs: 60,
        };
        config.clamp_batch_size();
        assert_eq!(config.batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn parses_toml_with_defaults() {
        let toml_text = r#"
            db_conn_string = "postgres://localhost/db"
            require_ssl = false
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.db_conn_string, "postgres://localhost/db");
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(!config.require_ssl);
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn ignores_unknown_keys() {
        let toml_text = r#"
            db_conn_string = "postgres://localhost/db"
            some_future_field = 42
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.db_conn_string, "postgres://localhost/db");
    }
}
