//! Configuration for the cmdwire server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "cmdwire")]
#[command(version)]
#[command(about = "A single-shot TCP command server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1 or 0.0.0.0)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Per-connection read/write timeout in milliseconds
    #[arg(long)]
    pub io_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Scheduling policy for the accept-loop thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// Default time-sharing scheduling
    Other,
    /// Real-time first-in-first-out
    Fifo,
    /// Real-time round-robin
    Rr,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to; the default is loopback-only
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Accept-loop polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Scheduling policy for the accept-loop thread
    pub accept_policy: Option<SchedPolicy>,
    /// Priority used with `accept_policy`
    #[serde(default)]
    pub accept_priority: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            backlog: default_backlog(),
            poll_interval_ms: default_poll_interval_ms(),
            accept_policy: None,
            accept_priority: 0,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    /// Read/write timeout in milliseconds
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Maximum request size read from a client
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            io_timeout_ms: default_io_timeout_ms(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    31415
}

fn default_backlog() -> u32 {
    15
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_io_timeout_ms() -> u64 {
    5000
}

fn default_max_request_bytes() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub backlog: u32,
    pub poll_interval_ms: u64,
    pub io_timeout_ms: u64,
    pub max_request_bytes: usize,
    pub accept_policy: Option<SchedPolicy>,
    pub accept_priority: i32,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: default_port(),
            backlog: default_backlog(),
            poll_interval_ms: default_poll_interval_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            max_request_bytes: default_max_request_bytes(),
            accept_policy: None,
            accept_priority: 0,
            log_level: default_log_level(),
        }
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

        let bind_str = cli.bind.unwrap_or(toml_config.server.bind_addr);
        let bind_addr: IpAddr = bind_str
            .parse()
            .map_err(|e| ConfigError::InvalidBindAddr(bind_str, e))?;

        Ok(Config {
            bind_addr,
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            poll_interval_ms: toml_config.server.poll_interval_ms,
            io_timeout_ms: cli
                .io_timeout_ms
                .unwrap_or(toml_config.connection.io_timeout_ms),
            max_request_bytes: toml_config.connection.max_request_bytes,
            accept_policy: toml_config.server.accept_policy,
            accept_priority: toml_config.server.accept_priority,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidBindAddr(String, AddrParseError),
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
            ConfigError::InvalidBindAddr(addr, e) => {
                write!(f, "Invalid bind address '{addr}': {e}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
