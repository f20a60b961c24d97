//! Configuration system for the Courier relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::Limits;
use crate::relay::{ConnectionSettings, DEFAULT_MAX_FRAME_SIZE};

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is out of range or malformed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// The offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    storage: StorageFileConfig,
    limits: LimitsFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
    ping_interval_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    log_file: Option<PathBuf>,
}

/// `[storage]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    url: Option<String>,
}

/// `[limits]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LimitsFileConfig {
    max_body_bytes: Option<usize>,
    default_page_size: Option<u32>,
    max_page_size: Option<u32>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courier chat and notification relay")]
pub struct RelayCliArgs {
    /// Address to bind the relay server to.
    #[arg(short, long, env = "COURIER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/courier-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Storage URL: `memory` or `sqlite://path/to/db`.
    #[arg(long, env = "COURIER_STORAGE")]
    pub storage: Option<String>,

    /// Maximum WebSocket message size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Maximum chat message body size in bytes.
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "COURIER_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Where messages and notifications are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process only; lost on restart.
    Memory,
    /// SQLite database at the given `sqlite://` URL.
    Sqlite(String),
}

impl StorageBackend {
    /// Parses `memory` or a `sqlite:` URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything else.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        if url == "memory" {
            Ok(Self::Memory)
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite(url.to_string()))
        } else {
            Err(ConfigError::InvalidValue {
                key: "storage.url",
                reason: format!("expected `memory` or `sqlite://...`, got `{url}`"),
            })
        }
    }
}

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Storage backend.
    pub storage: StorageBackend,
    /// Per-connection transport settings.
    pub connection: ConnectionSettings,
    /// Request size limits.
    pub limits: Limits,
    /// Log file; stderr when `None`.
    pub log_file: Option<PathBuf>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            storage: StorageBackend::Memory,
            connection: ConnectionSettings::default(),
            limits: Limits::default(),
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or a value is invalid.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let storage = match cli.storage.as_deref().or(file.storage.url.as_deref()) {
            Some(url) => StorageBackend::parse(url)?,
            None => defaults.storage,
        };

        let ping_interval = file
            .server
            .ping_interval_secs
            .map_or(defaults.connection.ping_interval, Duration::from_secs);
        let idle_timeout = file
            .server
            .idle_timeout_secs
            .map_or(defaults.connection.idle_timeout, Duration::from_secs);
        if ping_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "server.ping_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if idle_timeout <= ping_interval {
            return Err(ConfigError::InvalidValue {
                key: "server.idle_timeout_secs",
                reason: "must be longer than the ping interval".into(),
            });
        }

        let limits = Limits {
            max_body_bytes: cli
                .max_body_bytes
                .or(file.limits.max_body_bytes)
                .unwrap_or(defaults.limits.max_body_bytes),
            default_page_size: file
                .limits
                .default_page_size
                .unwrap_or(defaults.limits.default_page_size),
            max_page_size: file
                .limits
                .max_page_size
                .unwrap_or(defaults.limits.max_page_size),
        };
        if limits.max_page_size == 0 || limits.default_page_size > limits.max_page_size {
            return Err(ConfigError::InvalidValue {
                key: "limits.default_page_size",
                reason: format!(
                    "need 1 <= default_page_size ({}) <= max_page_size ({})",
                    limits.default_page_size, limits.max_page_size
                ),
            });
        }

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            storage,
            connection: ConnectionSettings {
                ping_interval,
                idle_timeout,
                max_frame_size: cli
                    .max_frame_size
                    .or(file.server.max_frame_size)
                    .unwrap_or(DEFAULT_MAX_FRAME_SIZE),
            },
            limits,
            log_file: cli
                .log_file
                .clone()
                .or_else(|| file.server.log_file.clone()),
            log_level: cli.log_level.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("courier-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(toml_str: &str, cli: &RelayCliArgs) -> Result<RelayConfig, ConfigError> {
        let file: RelayConfigFile = toml::from_str(toml_str).unwrap();
        RelayConfig::resolve(cli, &file)
    }

    #[test]
    fn defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.connection.max_frame_size, 64 * 1024);
        assert_eq!(config.limits.default_page_size, 50);
        assert_eq!(config.limits.max_page_size, 100);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[server]
bind_addr = "127.0.0.1:8080"
max_frame_size = 32768
ping_interval_secs = 10
idle_timeout_secs = 30
log_file = "/var/log/courier.log"

[storage]
url = "sqlite://courier.db"

[limits]
max_body_bytes = 4096
default_page_size = 20
max_page_size = 40
"#;
        let config = resolve(toml_str, &RelayCliArgs::default()).unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.connection.max_frame_size, 32768);
        assert_eq!(config.connection.ping_interval, Duration::from_secs(10));
        assert_eq!(config.connection.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/courier.log")));
        assert_eq!(
            config.storage,
            StorageBackend::Sqlite("sqlite://courier.db".into())
        );
        assert_eq!(config.limits.max_body_bytes, 4096);
        assert_eq!(config.limits.default_page_size, 20);
        assert_eq!(config.limits.max_page_size, 40);
    }

    #[test]
    fn toml_parsing_partial() {
        let toml_str = r"
[limits]
max_page_size = 200
";
        let config = resolve(toml_str, &RelayCliArgs::default()).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:9000"); // default
        assert_eq!(config.storage, StorageBackend::Memory); // default
        assert_eq!(config.limits.max_page_size, 200); // from file
    }

    #[test]
    fn toml_parsing_empty() {
        let config = resolve("", &RelayCliArgs::default()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.limits, Limits::default());
        assert_eq!(config.connection, ConnectionSettings::default());
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[server]
bind_addr = "127.0.0.1:8080"
max_frame_size = 32768

[storage]
url = "sqlite://file.db"
"#;
        let cli = RelayCliArgs {
            bind: Some("0.0.0.0:3000".to_string()),
            storage: Some("memory".to_string()),
            max_frame_size: None, // not set on CLI, falls through to file
            ..Default::default()
        };
        let config = resolve(toml_str, &cli).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:3000"); // from CLI
        assert_eq!(config.storage, StorageBackend::Memory); // from CLI
        assert_eq!(config.connection.max_frame_size, 32768); // from file
    }

    #[test]
    fn unknown_storage_url_rejected() {
        let toml_str = r#"
[storage]
url = "postgres://db"
"#;
        assert!(matches!(
            resolve(toml_str, &RelayCliArgs::default()),
            Err(ConfigError::InvalidValue {
                key: "storage.url",
                ..
            })
        ));
    }

    #[test]
    fn idle_timeout_must_exceed_ping_interval() {
        let toml_str = r"
[server]
ping_interval_secs = 30
idle_timeout_secs = 30
";
        assert!(matches!(
            resolve(toml_str, &RelayCliArgs::default()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn default_page_size_cannot_exceed_max() {
        let toml_str = r"
[limits]
default_page_size = 80
max_page_size = 60
";
        assert!(resolve(toml_str, &RelayCliArgs::default()).is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = load_config_file(None);
        assert!(result.is_ok());
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn explicit_config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[server]\nbind_addr = \"127.0.0.1:7000\"\n").unwrap();

        let cli = RelayCliArgs {
            config: Some(path),
            ..Default::default()
        };
        let config = RelayConfig::load(&cli).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000");
    }
}
