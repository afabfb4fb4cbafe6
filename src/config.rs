//! Configuration module for the frame-reactor echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::{IoConfig, ReactorConfig};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "frame-reactor")]
#[command(author = "frame-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "Framed echo server on an epoll reactor", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7400)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of reactor worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum ready connections handled per wait
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Read deadline per message in milliseconds (0 = no deadline)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Write deadline per message in milliseconds (0 = no deadline)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reactor: ReactorSection,
    #[serde(default)]
    pub io: IoSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Reactor-related configuration
#[derive(Debug, Deserialize)]
pub struct ReactorSection {
    /// Maximum ready connections returned per wait
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a worker blocks in one wait, in milliseconds
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Log the live connection count every this many connections
    #[serde(default = "default_milestone_interval")]
    pub milestone_interval: usize,
}

impl Default for ReactorSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            wait_timeout_ms: default_wait_timeout_ms(),
            milestone_interval: default_milestone_interval(),
        }
    }
}

/// Framed I/O configuration
#[derive(Debug, Deserialize)]
pub struct IoSection {
    /// Read deadline per message
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write deadline per message
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Upper bound on a single OS-level wait inside a read or write
    #[serde(default = "default_attempt_interval_ms")]
    pub attempt_interval_ms: u64,
    /// Largest accepted message body
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for IoSection {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            attempt_interval_ms: default_attempt_interval_ms(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_batch_size() -> usize {
    crate::runtime::reactor::DEFAULT_BATCH_SIZE
}

fn default_wait_timeout_ms() -> u64 {
    100
}

fn default_milestone_interval() -> usize {
    crate::runtime::reactor::DEFAULT_MILESTONE_INTERVAL
}

fn default_io_timeout_ms() -> u64 {
    1000
}

fn default_attempt_interval_ms() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    crate::runtime::connection::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    /// Worker threads; 0 means one per CPU core.
    pub workers: usize,
    pub batch_size: usize,
    pub wait_timeout_ms: u64,
    pub milestone_interval: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub attempt_interval_ms: u64,
    pub max_message_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the optional TOML file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            batch_size: cli.batch_size.unwrap_or(toml_config.reactor.batch_size),
            wait_timeout_ms: toml_config.reactor.wait_timeout_ms,
            milestone_interval: toml_config.reactor.milestone_interval,
            read_timeout_ms: cli.read_timeout_ms.unwrap_or(toml_config.io.read_timeout_ms),
            write_timeout_ms: cli
                .write_timeout_ms
                .unwrap_or(toml_config.io.write_timeout_ms),
            attempt_interval_ms: toml_config.io.attempt_interval_ms,
            max_message_size: toml_config.io.max_message_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reactor tuning derived from this configuration.
    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            batch_size: self.batch_size,
            milestone_interval: self.milestone_interval,
            io: IoConfig {
                attempt_interval: Duration::from_millis(self.attempt_interval_ms.max(1)),
                max_message_size: self.max_message_size,
            },
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                listen: None,
                workers: None,
                batch_size: None,
                read_timeout_ms: None,
                write_timeout_ms: None,
                log_level: default_log_level(),
            },
            TomlConfig::default(),
        )
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
