//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, SwitchConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/switchboard/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("switchboard/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("switchboard.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load a config file as a raw TOML table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`; overlay values win, nested tables
/// merge key-by-key so a partial file only touches what it names.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge_tables(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut SwitchConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("SWITCHBOARD_WS_ADDR") {
        config.bind.ws_addr = v;
        sources.env_overrides.push("SWITCHBOARD_WS_ADDR".to_string());
    }
    if let Ok(v) = env::var("SWITCHBOARD_WS_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.ws_port = port;
            sources.env_overrides.push("SWITCHBOARD_WS_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("SWITCHBOARD_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
        sources
            .env_overrides
            .push("SWITCHBOARD_OTLP_ENDPOINT".to_string());
    }
    // Also support the standard OTEL env var
    if let Ok(v) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
        sources
            .env_overrides
            .push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }
    if let Ok(v) = env::var("SWITCHBOARD_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources
            .env_overrides
            .push("SWITCHBOARD_LOG_LEVEL".to_string());
    }

    if let Ok(v) = env::var("SWITCHBOARD_ASYNC_THRESHOLD_MS") {
        if let Ok(ms) = v.parse() {
            config.router.async_threshold_ms = ms;
            sources
                .env_overrides
                .push("SWITCHBOARD_ASYNC_THRESHOLD_MS".to_string());
        }
    }
    if let Ok(v) = env::var("SWITCHBOARD_PAYLOAD_MAX_BYTES") {
        if let Ok(bytes) = v.parse() {
            config.router.payload_max_bytes = bytes;
            sources
                .env_overrides
                .push("SWITCHBOARD_PAYLOAD_MAX_BYTES".to_string());
        }
    }
    if let Ok(v) = env::var("SWITCHBOARD_WORKER_POOL_SIZE") {
        if let Ok(size) = v.parse() {
            config.sender.worker_pool_size = size;
            sources
                .env_overrides
                .push("SWITCHBOARD_WORKER_POOL_SIZE".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_deep() {
        let mut base: toml::Table = "[sender]\nworker_pool_size = 10\nretry_max = 3\n"
            .parse()
            .unwrap();
        let overlay: toml::Table = "[sender]\nworker_pool_size = 2\n".parse().unwrap();

        merge_tables(&mut base, overlay);

        let sender = base["sender"].as_table().unwrap();
        assert_eq!(sender["worker_pool_size"].as_integer(), Some(2));
        assert_eq!(sender["retry_max"].as_integer(), Some(3));
    }

    #[test]
    fn missing_cli_path_is_skipped() {
        let files =
            discover_config_files_with_override(Some(Path::new("/nonexistent/nope.toml")));
        assert!(!files.iter().any(|p| p.ends_with("nope.toml")));
    }
}
