//! Configuration handling for the chat-relay service.
//!
//! Reads the YAML config file and environment variables into a unified
//! configuration, falling back to built-in defaults when either is absent.

use anyhow::Result;
use relay_storage::StorageMode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// chat-relay service configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Wait between reconnection attempts after a transient disconnect
    pub reconnect_delay: Duration,
    /// How long ingested messages are retained
    pub retention_window: Duration,
    /// Storage backend selection
    pub storage_mode: String,
    /// Redis connection URL, used when `storage_mode` is `redis`
    pub redis_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            retention_window: Duration::from_secs(24 * 60 * 60),
            storage_mode: "memory".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Root configuration structure (matches the YAML layout)
#[derive(Debug, Deserialize)]
struct RootConfig {
    relay: Option<RelaySection>,
}

#[derive(Debug, Deserialize)]
struct RelaySection {
    reconnect_delay: Option<String>,
    retention_window: Option<String>,
    storage: Option<StorageSection>,
}

#[derive(Debug, Deserialize)]
struct StorageSection {
    mode: Option<String>,
    redis_url: Option<String>,
}

impl RelayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(root_config) = serde_yaml::from_str::<RootConfig>(&content) {
                config.apply_root_config(root_config);
                info!("Loaded configuration from {:?}", config_path.as_ref());
            } else {
                warn!(
                    "Failed to parse config file {:?}, using defaults",
                    config_path.as_ref()
                );
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();

        info!(
            "Final relay configuration: storage={}, reconnect_delay={:?}, retention={:?}",
            config.storage_mode, config.reconnect_delay, config.retention_window
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        let Some(relay) = root_config.relay else {
            return;
        };

        if let Some(value) = relay.reconnect_delay {
            self.set_duration("relay.reconnect_delay", &value, |config, d| {
                config.reconnect_delay = d
            });
        }
        if let Some(value) = relay.retention_window {
            self.set_duration("relay.retention_window", &value, |config, d| {
                config.retention_window = d
            });
        }
        if let Some(storage) = relay.storage {
            if let Some(mode) = storage.mode {
                self.storage_mode = mode;
            }
            if let Some(url) = storage.redis_url {
                self.redis_url = url;
            }
        }
    }

    fn set_duration(&mut self, key: &str, value: &str, apply: fn(&mut Self, Duration)) {
        match humantime::parse_duration(value) {
            Ok(duration) => apply(self, duration),
            Err(e) => warn!("Ignoring invalid duration for {}: {:?} ({})", key, value, e),
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(value) = std::env::var("RELAY_RECONNECT_DELAY") {
            self.set_duration("RELAY_RECONNECT_DELAY", &value, |config, d| {
                config.reconnect_delay = d
            });
            info!("Reconnect delay overridden by environment: {}", value);
        }

        if let Ok(value) = std::env::var("RELAY_RETENTION_WINDOW") {
            self.set_duration("RELAY_RETENTION_WINDOW", &value, |config, d| {
                config.retention_window = d
            });
            info!("Retention window overridden by environment: {}", value);
        }

        if let Ok(mode) = std::env::var("RELAY_STORAGE_MODE") {
            self.storage_mode = mode.clone();
            info!("Storage mode overridden by environment: {}", mode);
        }

        if let Ok(url) = std::env::var("RELAY_REDIS_URL") {
            self.redis_url = url;
            info!("Redis URL overridden by environment");
        }
    }

    /// Resolve the configured storage backend
    pub fn storage(&self) -> StorageMode {
        match self.storage_mode.as_str() {
            "memory" => StorageMode::InMemory,
            "redis" => StorageMode::Redis {
                url: self.redis_url.clone(),
            },
            other => {
                warn!("Unknown storage mode {:?}, falling back to memory", other);
                StorageMode::InMemory
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.retention_window, Duration::from_secs(86400));
        assert_eq!(config.storage_mode, "memory");
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
relay:
  reconnect_delay: 10s
  retention_window: 48h
  storage:
    mode: redis
    redis_url: redis://cache.internal:6380
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = RelayConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.reconnect_delay, Duration::from_secs(10));
        assert_eq!(config.retention_window, Duration::from_secs(48 * 3600));
        assert_eq!(config.storage_mode, "redis");
        assert_eq!(config.redis_url, "redis://cache.internal:6380");
        assert!(matches!(config.storage(), StorageMode::Redis { .. }));
    }

    #[test]
    fn test_invalid_duration_keeps_default() {
        let yaml_content = r#"
relay:
  reconnect_delay: not-a-duration
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = RelayConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_storage_mode_falls_back_to_memory() {
        let config = RelayConfig {
            storage_mode: "s3".to_string(),
            ..RelayConfig::default()
        };
        assert!(matches!(config.storage(), StorageMode::InMemory));
    }
}
