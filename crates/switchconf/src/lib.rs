//! Minimal configuration loading for switchboard.
//!
//! Every tunable the gateway recognizes lives here, grouped by the
//! component that consumes it. Values load in order (later wins):
//!
//! 1. Compiled defaults
//! 2. `/etc/switchboard/config.toml` (system)
//! 3. `~/.config/switchboard/config.toml` (user)
//! 4. `./switchboard.toml` (local override, or the `--config` path)
//! 5. Environment variables (`SWITCHBOARD_*`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! ws_addr = "0.0.0.0"
//! ws_port = 8090
//!
//! [telemetry]
//! otlp_endpoint = "127.0.0.1:4317"
//! log_level = "info"
//!
//! [router]
//! async_threshold_ms = 5000
//! payload_max_bytes = 1048576
//!
//! [sender]
//! worker_pool_size = 10
//! retry_max = 3
//! retry_base_ms = 100
//! circuit_trip_after = 3
//! circuit_cooldown_secs = 30
//!
//! [progress]
//! interval_min_ms = 100
//! max_batch = 10
//! flush_threshold = 95
//!
//! [ttl]
//! connection_ttl_hours = 24
//! request_ttl_days = 7
//! ```

pub mod loader;

pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// WebSocket bind address for the local adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    pub ws_addr: String,
    pub ws_port: u16,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            ws_addr: "0.0.0.0".to_string(),
            ws_port: 8090,
        }
    }
}

/// Tracing and OTLP export settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint; plain fmt logging when unset.
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// Router dispatch tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Estimated durations above this are queued instead of run in-line.
    pub async_threshold_ms: u64,
    /// Inbound payload size ceiling.
    pub payload_max_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            async_threshold_ms: 5_000,
            payload_max_bytes: 1_048_576,
        }
    }
}

impl RouterConfig {
    pub fn async_threshold(&self) -> Duration {
        Duration::from_millis(self.async_threshold_ms)
    }
}

/// Connection manager tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub worker_pool_size: usize,
    pub retry_max: u32,
    pub retry_base_ms: u64,
    pub circuit_trip_after: u32,
    pub circuit_cooldown_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            retry_max: 3,
            retry_base_ms: 100,
            circuit_trip_after: 3,
            circuit_cooldown_secs: 30,
        }
    }
}

impl SenderConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }
}

/// Progress reporter and batcher tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub interval_min_ms: u64,
    pub max_batch: usize,
    pub flush_threshold: u8,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval_min_ms: 100,
            max_batch: 10,
            flush_threshold: 95,
        }
    }
}

impl ProgressConfig {
    pub fn interval_min(&self) -> Duration {
        Duration::from_millis(self.interval_min_ms)
    }
}

/// Record expiry horizons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub connection_ttl_hours: u64,
    pub request_ttl_days: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            connection_ttl_hours: 24,
            request_ttl_days: 7,
        }
    }
}

impl TtlConfig {
    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_hours * 3600)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_days * 86_400)
    }
}

/// Complete switchboard configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub bind: BindConfig,
    pub telemetry: TelemetryConfig,
    pub router: RouterConfig,
    pub sender: SenderConfig,
    pub progress: ProgressConfig,
    pub ttl: TtlConfig,
}

impl SwitchConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional CLI config path taking the
    /// place of the local override.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which sources contributed.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut table = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_table = loader::load_table(&path)?;
            loader::merge_tables(&mut table, file_table);
            sources.files.push(path);
        }

        let mut config: SwitchConfig =
            toml::Value::Table(table)
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: PathBuf::from("<merged>"),
                    message: e.to_string(),
                })?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_options() {
        let config = SwitchConfig::default();
        assert_eq!(config.router.async_threshold(), Duration::from_secs(5));
        assert_eq!(config.router.payload_max_bytes, 1_048_576);
        assert_eq!(config.sender.worker_pool_size, 10);
        assert_eq!(config.sender.retry_max, 3);
        assert_eq!(config.sender.retry_base(), Duration::from_millis(100));
        assert_eq!(config.sender.circuit_trip_after, 3);
        assert_eq!(config.sender.circuit_cooldown(), Duration::from_secs(30));
        assert_eq!(config.progress.interval_min(), Duration::from_millis(100));
        assert_eq!(config.progress.max_batch, 10);
        assert_eq!(config.progress.flush_threshold, 95);
        assert_eq!(config.ttl.connection_ttl(), Duration::from_secs(24 * 3600));
        assert_eq!(config.ttl.request_ttl(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        std::fs::write(&path, "[sender]\nworker_pool_size = 4\n").unwrap();

        let config = SwitchConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.sender.worker_pool_size, 4);
        assert_eq!(config.sender.retry_max, 3);
        assert_eq!(config.router.async_threshold_ms, 5_000);
    }

    #[test]
    fn parse_error_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        std::fs::write(&path, "not = [valid").unwrap();

        let err = SwitchConfig::load_from(Some(&path)).unwrap_err();
        match err {
            ConfigError::Parse { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
