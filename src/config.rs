//! Configuration module for the murmur server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{ArgAction, Parser};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(author = "murmur authors")]
#[command(about = "A multi-client microblogging server", long_about = None)]
#[command(disable_help_flag = true)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Add a random delay before processing PUBLISH, FOLLOW and TIMELINE
    #[arg(short = 'r', long)]
    pub random_delay: bool,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum number of simultaneously logged-in clients
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Capacity of the command queue
    #[arg(short = 'q', long)]
    pub queue_capacity: Option<usize>,

    /// Number of execution threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print usage
    #[arg(short = 'h', long, action = ArgAction::SetTrue)]
    pub help: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and client limits
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog of the server socket
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_clients: default_max_clients(),
        }
    }
}

/// Command queue configuration
#[derive(Debug, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

/// Execution pool configuration
#[derive(Debug, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub random_delay: bool,
    /// Upper bound of the random delay, in microseconds
    #[serde(default = "default_max_delay_us")]
    pub max_delay_us: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            random_delay: false,
            max_delay_us: default_max_delay_us(),
        }
    }
}

/// Timeline configuration
#[derive(Debug, Deserialize)]
pub struct TimelineConfig {
    /// Publications returned per TIMELINE
    #[serde(default = "default_timeline_max")]
    pub max_entries: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            max_entries: default_timeline_max(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5656
}

fn default_backlog() -> i32 {
    100
}

fn default_max_clients() -> usize {
    1000
}

fn default_queue_capacity() -> usize {
    5
}

fn default_workers() -> usize {
    1
}

fn default_max_delay_us() -> u64 {
    10_000 // 10 ms
}

fn default_timeline_max() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_clients: usize,
    pub queue_capacity: usize,
    pub workers: usize,
    pub random_delay: bool,
    pub max_delay_us: u64,
    pub timeline_max: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(None, TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        if cli.help {
            return Err(ConfigError::HelpRequested);
        }

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(Some(cli), toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: Option<CliArgs>, toml_config: TomlConfig) -> Self {
        let Some(cli) = cli else {
            return Config {
                host: toml_config.server.host,
                port: toml_config.server.port,
                backlog: toml_config.server.backlog,
                max_clients: toml_config.server.max_clients,
                queue_capacity: toml_config.queue.capacity,
                workers: toml_config.executor.workers,
                random_delay: toml_config.executor.random_delay,
                max_delay_us: toml_config.executor.max_delay_us,
                timeline_max: toml_config.timeline.max_entries,
                log_level: toml_config.logging.level,
            };
        };

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            max_clients: cli.max_clients.unwrap_or(toml_config.server.max_clients),
            queue_capacity: cli.queue_capacity.unwrap_or(toml_config.queue.capacity),
            workers: cli.workers.unwrap_or(toml_config.executor.workers),
            random_delay: cli.random_delay || toml_config.executor.random_delay,
            max_delay_us: toml_config.executor.max_delay_us,
            timeline_max: toml_config.timeline.max_entries,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("port", self.port as usize),
            ("max_clients", self.max_clients),
            ("queue capacity", self.queue_capacity),
            ("workers", self.workers),
            ("timeline max_entries", self.timeline_max),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than zero"));
            }
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog", "must be greater than zero"));
        }
        Ok(())
    }

    /// Address the acceptor binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid {0}: {1}")]
    Invalid(&'static str, &'static str),
    #[error("usage requested")]
    HelpRequested,
}
