//! Configuration for the cache server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "minicached")]
#[command(version)]
#[command(about = "A text-protocol key/value cache server with LRU eviction", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:11211)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Runtime flavor
    #[arg(short = 'r', long)]
    pub runtime: Option<RuntimeType>,

    /// Reactor threads for the nonblocking runtime (0 = CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Storage capacity in bytes
    #[arg(short = 'm', long)]
    pub max_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Deployment flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Thread-per-connection on the auto-scaling worker pool.
    Blocking,
    /// mio reactor thread(s).
    Nonblocking,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    /// Reactor threads; 0 resolves to the number of CPU cores.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: default_runtime(),
            workers: 0,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Capacity in bytes (sum of key+value lengths).
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_idle_time_ms")]
    pub idle_time_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
            max_queue_size: default_max_queue_size(),
            idle_time_ms: default_idle_time_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "127.0.0.1:11211".to_string()
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Nonblocking
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_size() -> usize {
    64 * 1024 * 1024
}

fn default_low_watermark() -> usize {
    4
}

fn default_high_watermark() -> usize {
    32
}

fn default_max_queue_size() -> usize {
    128
}

fn default_idle_time_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub runtime: RuntimeType,
    pub workers: usize,
    pub max_connections: usize,
    pub max_size: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub max_queue_size: usize,
    pub idle_time: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let workers = match cli.workers.unwrap_or(toml_config.server.workers) {
            0 => num_cpus(),
            n => n,
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            workers,
            max_connections: toml_config.server.max_connections,
            max_size: cli.max_size.unwrap_or(toml_config.storage.max_size),
            low_watermark: toml_config.executor.low_watermark,
            high_watermark: toml_config.executor.high_watermark,
            max_queue_size: toml_config.executor.max_queue_size,
            idle_time: Duration::from_millis(toml_config.executor.idle_time_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid("storage.max_size must be positive"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be positive",
            ));
        }
        if self.low_watermark == 0 {
            return Err(ConfigError::Invalid(
                "executor.low_watermark must be positive",
            ));
        }
        if self.high_watermark < self.low_watermark {
            return Err(ConfigError::Invalid(
                "executor.high_watermark must not be below low_watermark",
            ));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_queue_size must be positive",
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:11211");
        assert_eq!(config.server.runtime, RuntimeType::Nonblocking);
        assert_eq!(config.storage.max_size, 64 * 1024 * 1024);
        assert_eq!(config.executor.low_watermark, 4);
        assert_eq!(config.executor.high_watermark, 32);
    }

    #[test]
    fn toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:11211"
            runtime = "blocking"
            workers = 4

            [storage]
            max_size = 1048576

            [executor]
            low_watermark = 2
            high_watermark = 8
            max_queue_size = 64
            idle_time_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:11211");
        assert_eq!(config.server.runtime, RuntimeType::Blocking);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.storage.max_size, 1048576);
        assert_eq!(config.executor.low_watermark, 2);
        assert_eq!(config.executor.high_watermark, 8);
        assert_eq!(config.executor.max_queue_size, 64);
        assert_eq!(config.executor.idle_time_ms, 250);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: TomlConfig = toml::from_str("[storage]\nmax_size = 4096\n").unwrap();
        assert_eq!(config.storage.max_size, 4096);
        assert_eq!(config.server.listen, "127.0.0.1:11211");
        assert_eq!(config.executor.max_queue_size, 128);
    }

    #[test]
    fn watermark_validation() {
        let config = Config {
            listen: default_listen(),
            runtime: RuntimeType::Blocking,
            workers: 1,
            max_connections: 16,
            max_size: 1024,
            low_watermark: 4,
            high_watermark: 2,
            max_queue_size: 8,
            idle_time: Duration::from_millis(100),
            log_level: "info".to_string(),
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            low_watermark: 2,
            high_watermark: 2,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_low_watermark_rejected() {
        let config = Config {
            listen: default_listen(),
            runtime: RuntimeType::Blocking,
            workers: 1,
            max_connections: 16,
            max_size: 1024,
            low_watermark: 0,
            high_watermark: 2,
            max_queue_size: 8,
            idle_time: Duration::from_millis(100),
            log_level: "info".to_string(),
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
