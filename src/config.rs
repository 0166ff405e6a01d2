//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and an optional TOML configuration
//! file. CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use crate::codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::handler::HandlerConfig;
use crate::listener::{ListenerConfig, DEFAULT_BACKLOG, DEFAULT_MAX_CONNECTIONS};
use crate::shutdown::DEFAULT_GRACE_PERIOD;
use crate::write_queue::{WaterMarks, DEFAULT_HIGH_WATER_MARK, DEFAULT_LOW_WATER_MARK};
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "frame-echo-server")]
#[command(version)]
#[command(about = "Length-prefixed TCP echo server", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum frame payload size in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Seconds connections get to drain during shutdown
    #[arg(long)]
    pub shutdown_grace_seconds: Option<u64>,

    /// Queued echo bytes at which reads from a connection pause
    #[arg(long)]
    pub high_water_mark: Option<usize>,

    /// Queued echo bytes at which paused reads resume
    #[arg(long)]
    pub low_water_mark: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            workers: None,
        }
    }
}

/// Framing and memory limits
#[derive(Debug, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            high_water_mark: default_high_water_mark(),
            low_water_mark: default_low_water_mark(),
            max_connections: default_max_connections(),
        }
    }
}

/// Shutdown behaviour
#[derive(Debug, Deserialize)]
pub struct ShutdownSection {
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            grace_seconds: default_grace_seconds(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

fn default_low_water_mark() -> usize {
    DEFAULT_LOW_WATER_MARK
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_grace_seconds() -> u64 {
    DEFAULT_GRACE_PERIOD.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_frame_size: usize,
    pub shutdown_grace: Duration,
    pub high_water_mark: usize,
    pub low_water_mark: usize,
    pub backlog: i32,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(ServerArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    /// Resolve already-parsed CLI arguments, reading the TOML file they
    /// point at if any.
    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: ServerArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.limits.max_frame_size),
            shutdown_grace: Duration::from_secs(
                cli.shutdown_grace_seconds
                    .unwrap_or(toml_config.shutdown.grace_seconds),
            ),
            high_water_mark: cli
                .high_water_mark
                .unwrap_or(toml_config.limits.high_water_mark),
            low_water_mark: cli
                .low_water_mark
                .unwrap_or(toml_config.limits.low_water_mark),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.limits.max_connections),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be between 1 and {}, got {}",
                u32::MAX,
                self.max_frame_size
            )));
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(ConfigError::Invalid(format!(
                "low_water_mark ({}) must be below high_water_mark ({})",
                self.low_water_mark, self.high_water_mark
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{}'", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            codec: FrameCodec::new(self.max_frame_size),
            water_marks: WaterMarks {
                high: self.high_water_mark,
                low: self.low_water_mark,
            },
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            backlog: self.backlog,
            max_connections: self.max_connections,
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
