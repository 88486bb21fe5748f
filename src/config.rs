//! Configuration management for CLI, environment variables, and config files.

use crate::error::BtError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for btstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Peer and tracker connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Cap on connected peers across all torrents.
    pub max_peers_global: usize,
    /// Cap on connected peers per torrent.
    pub max_peers_torrent: usize,
    /// Port advertised to trackers. Informational only; the engine does
    /// not accept inbound connections.
    pub listen_port: u16,
    /// How long a magnet open waits for metadata before giving up, seconds.
    pub metadata_timeout: u64,
}

/// Disk cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one packed `.tc` file per torrent.
    pub directory: PathBuf,
    /// Fraction of (free + cached) disk space the cache may occupy.
    pub free_space_percentage: u8,
}

/// Outbound bandwidth limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Upload ceiling in bytes per second, enforced by a token bucket.
    pub max_send_speed: u64,
}

/// Logging output level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_peers_global: 200,
            max_peers_torrent: 50,
            listen_port: 43213,
            metadata_timeout: 60,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("btstream"),
            free_space_percentage: 80,
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            max_send_speed: 5_000_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// A single failed validation check: field path plus what is wrong with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &PathBuf) -> Result<Self, BtError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| BtError::Io(e.to_string()))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext.as_deref() {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| BtError::Config(e.to_string())),
            _ => toml::from_str(&content)
                .map_err(|e| BtError::Config(e.to_string())),
        }
    }

    pub fn from_default_locations() -> Result<Self, BtError> {
        let config_dirs = [
            dirs::config_dir().map(|d| d.join("btstream/config.toml")),
            Some(PathBuf::from("/etc/btstream/config.toml")),
            Some(PathBuf::from("./btstream.toml")),
        ];

        for path in config_dirs.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn merge_from_env(mut self) -> Result<Self, BtError> {
        if let Ok(val) = std::env::var("BTSTREAM_CACHE_DIR") {
            self.cache.directory = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("BTSTREAM_MAX_PEERS_GLOBAL") {
            self.network.max_peers_global = parse_env("BTSTREAM_MAX_PEERS_GLOBAL", &val)?;
        }
        if let Ok(val) = std::env::var("BTSTREAM_MAX_PEERS_TORRENT") {
            self.network.max_peers_torrent = parse_env("BTSTREAM_MAX_PEERS_TORRENT", &val)?;
        }
        if let Ok(val) = std::env::var("BTSTREAM_LISTEN_PORT") {
            self.network.listen_port = parse_env("BTSTREAM_LISTEN_PORT", &val)?;
        }
        if let Ok(val) = std::env::var("BTSTREAM_MAX_SEND_SPEED") {
            self.rate.max_send_speed = parse_env("BTSTREAM_MAX_SEND_SPEED", &val)?;
        }
        if let Ok(val) = std::env::var("BTSTREAM_FREE_SPACE_PERCENTAGE") {
            self.cache.free_space_percentage =
                parse_env("BTSTREAM_FREE_SPACE_PERCENTAGE", &val)?;
        }
        if let Ok(val) = std::env::var("BTSTREAM_LOG_LEVEL") {
            self.logging.level = val;
        }
        Ok(self)
    }

    pub fn load() -> Result<Self, BtError> {
        Self::from_default_locations()?.merge_from_env()
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        if self.network.max_peers_global == 0 {
            issues.push(ValidationIssue {
                field: "network.max_peers_global".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.network.max_peers_torrent == 0 {
            issues.push(ValidationIssue {
                field: "network.max_peers_torrent".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.network.max_peers_torrent > self.network.max_peers_global {
            issues.push(ValidationIssue {
                field: "network.max_peers_torrent".to_string(),
                message: "cannot exceed network.max_peers_global".to_string(),
            });
        }
        if self.cache.free_space_percentage == 0 || self.cache.free_space_percentage > 100 {
            issues.push(ValidationIssue {
                field: "cache.free_space_percentage".to_string(),
                message: "must be between 1 and 100".to_string(),
            });
        }
        if self.cache.directory.as_os_str().is_empty() {
            issues.push(ValidationIssue {
                field: "cache.directory".to_string(),
                message: "cannot be empty".to_string(),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T, BtError> {
    val.parse()
        .map_err(|_| BtError::Config(format!("{name} has invalid format")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.network.max_peers_global, 200);
        assert_eq!(config.network.max_peers_torrent, 50);
        assert_eq!(config.cache.free_space_percentage, 80);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_bad_limits() {
        let mut config = Config::default();
        config.network.max_peers_global = 0;
        config.cache.free_space_percentage = 150;
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 3); // global=0 also makes torrent > global
        assert!(issues
            .iter()
            .any(|i| i.field == "cache.free_space_percentage"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_src = r#"
            [network]
            max_peers_global = 10
            max_peers_torrent = 5

            [cache]
            directory = "/tmp/bt"
            free_space_percentage = 50
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.network.max_peers_global, 10);
        assert_eq!(config.cache.directory, PathBuf::from("/tmp/bt"));
        // Unset sections fall back to defaults
        assert_eq!(config.rate.max_send_speed, 5_000_000);
        assert_eq!(config.network.listen_port, 43213);
    }

    #[test]
    fn test_json_config_parses() {
        let json_src = r#"{"rate": {"max_send_speed": 123}}"#;
        let config: Config = serde_json::from_str(json_src).unwrap();
        assert_eq!(config.rate.max_send_speed, 123);
    }
}
