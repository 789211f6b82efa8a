//! Configuration for the grow-a-socket binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. Unknown config
//! file keys are rejected.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::server::{Listen, ServerConfig};

/// Command-line arguments for the WebSocket echo server.
#[derive(Parser, Debug)]
#[command(name = "grow-a-socket")]
#[command(author = "grow-a-socket authors")]
#[command(version = "0.1.0")]
#[command(about = "A minimal WebSocket echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Seconds of allowed silence before pinging a connection (0 disables)
    #[arg(short = 's', long)]
    pub silence_max: Option<u64>,

    /// Maximum size of an assembled message in bytes
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
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
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds of allowed silence before pinging (0 disables)
    #[serde(default = "default_silence_max")]
    pub silence_max: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            silence_max: default_silence_max(),
        }
    }
}

/// Resource limits
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    /// Maximum size of an assembled message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
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

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_silence_max() -> u64 {
    20
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

fn default_max_connections() -> usize {
    10240
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub silence_max: u64,
    pub max_message_size: usize,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(listen))?;

        Ok(Config {
            listen,
            silence_max: cli.silence_max.unwrap_or(toml_config.server.silence_max),
            max_message_size: cli
                .max_message_size
                .unwrap_or(toml_config.limits.max_message_size),
            max_connections: toml_config.limits.max_connections,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// The library-facing slice of this configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: Listen::Addr(self.listen),
            silence_max: self.silence_max,
            max_message_size: self.max_message_size,
            max_connections: self.max_connections,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String),
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
            ConfigError::InvalidAddress(addr) => {
                write!(f, "Invalid listen address '{addr}': expected host:port")
            }
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
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.silence_max, 20);
        assert_eq!(config.limits.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9001"
            silence_max = 45

            [limits]
            max_message_size = 1048576
            max_connections = 128

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9001");
        assert_eq!(config.server.silence_max, 45);
        assert_eq!(config.limits.max_message_size, 1048576);
        assert_eq!(config.limits.max_connections, 128);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_option_rejected() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9001"
            silense_max = 45
        "#;
        assert!(toml::from_str::<TomlConfig>(toml_str).is_err());
    }

    #[test]
    fn test_unknown_section_rejected() {
        let toml_str = r#"
            [metrics]
            enabled = true
        "#;
        assert!(toml::from_str::<TomlConfig>(toml_str).is_err());
    }
}
