//! Configuration module for the logecho server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the log echo server
#[derive(Parser, Debug)]
#[command(name = "logecho")]
#[command(author = "logecho authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that appends packets to a shared log and echoes it back", long_about = None)]
pub struct CliArgs {
    /// Run as a daemon (detach from the controlling terminal)
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Path of the shared data file
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Seconds between timestamp records
    #[arg(long)]
    pub timestamp_interval: Option<u64>,

    /// Maximum number of connections served at once
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write diagnostics to this file instead of stdout or the journal
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: DataLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Detach from the terminal after binding
    #[serde(default)]
    pub daemon: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            daemon: false,
        }
    }
}

/// Shared data file configuration
#[derive(Debug, Deserialize)]
pub struct DataLogConfig {
    /// Location of the append-only data file
    #[serde(default = "default_data_file")]
    pub path: PathBuf,
    /// Seconds between timestamp records (0 disables them)
    #[serde(default = "default_timestamp_interval")]
    pub timestamp_interval: u64,
}

impl Default for DataLogConfig {
    fn default() -> Self {
        Self {
            path: default_data_file(),
            timestamp_interval: default_timestamp_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Diagnostics file; daemon mode logs to the journal when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_backlog() -> i32 {
    5
}

fn default_max_connections() -> usize {
    1024
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_timestamp_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub max_connections: usize,
    pub daemon: bool,
    pub data_file: PathBuf,
    /// `None` disables the timestamper.
    pub timestamp_interval: Option<Duration>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let interval = cli
            .timestamp_interval
            .unwrap_or(toml_config.log.timestamp_interval);

        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            daemon: cli.daemon || toml_config.server.daemon,
            data_file: cli.data_file.unwrap_or(toml_config.log.path),
            timestamp_interval: (interval > 0).then(|| Duration::from_secs(interval)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid(
                "backlog must be greater than zero".to_string(),
            ));
        }
        if self.data_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data file path is empty".to_string()));
        }
        Ok(())
    }
}

impl CliArgs {
    fn default_args() -> Self {
        CliArgs {
            daemon: false,
            config: None,
            listen: None,
            data_file: None,
            timestamp_interval: None,
            max_connections: None,
            log_level: None,
            log_file: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.backlog, 5);
        assert_eq!(config.log.path, PathBuf::from("/var/tmp/aesdsocketdata"));
        assert_eq!(config.log.timestamp_interval, 10);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9100"
            max_connections = 16
            daemon = true

            [log]
            path = "/tmp/logecho.data"
            timestamp_interval = 0

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9100");
        assert_eq!(config.server.max_connections, 16);
        assert!(config.server.daemon);
        assert_eq!(config.log.path, PathBuf::from("/tmp/logecho.data"));
        assert_eq!(config.logging.level, "debug");

        let merged = Config::merge(CliArgs::default_args(), config);
        assert!(merged.daemon);
        assert_eq!(merged.timestamp_interval, None);
        assert_eq!(merged.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::parse_from([
            "logecho",
            "-d",
            "--listen",
            "127.0.0.1:0",
            "--timestamp-interval",
            "3",
        ]);
        let config = Config::merge(cli, TomlConfig::default());
        assert!(config.daemon);
        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.timestamp_interval, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_explicit_cli_log_level_wins() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"
            file = "/var/log/logecho.log"
        "#,
        )
        .unwrap();

        let cli = CliArgs::parse_from(["logecho", "--log-level", "info"]);
        let config = Config::merge(cli, toml_config);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/logecho.log")));

        let config = Config::merge(CliArgs::parse_from(["logecho"]), TomlConfig::default());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_file, None);
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let config = Config {
            max_connections: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(Config::default().validate().is_ok());
    }
}
