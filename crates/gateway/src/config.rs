//! Configuration management for the gateway.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/openiot/gateway.toml`.
//!
//! ```toml
//! [server]
//! name = "Open IoT Server"
//! workers = 2
//!
//! [udp.lora]
//! listen = "0.0.0.0:5555"
//! gateway = "192.168.1.10:1700"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::DEFAULT_MAX_PACKET_SIZE;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("server name must not be empty")]
    EmptyServerName,

    #[error("workers must be between 1 and {max}, got {got}", max = MAX_WORKERS)]
    InvalidWorkers { got: usize },

    #[error("intake_queue must be greater than 0")]
    InvalidIntakeQueue,

    #[error("key_exchange_cache_size must be greater than 0")]
    InvalidCacheSize,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("udp.{transport}: listen address '{address}' is not a socket address")]
    InvalidListenAddress { transport: String, address: String },

    #[error("udp.{transport}: gateway address '{address}' must be host:port")]
    InvalidGatewayAddress { transport: String, address: String },

    #[error("udp.{transport}: max_packet_size must be between 1 and 65507, got {size}")]
    InvalidPacketSize { transport: String, size: usize },
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound on dispatcher worker tasks.
const MAX_WORKERS: usize = 64;

/// Largest UDP payload over IPv4.
const MAX_UDP_PAYLOAD: usize = 65507;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General server configuration.
    pub server: ServerConfig,

    /// Device onboarding settings.
    pub onboarding: OnboardingConfig,

    /// UDP transports keyed by instance name.
    pub udp: BTreeMap<String, UdpTransportConfig>,
}

/// General server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Name announced to devices in join responses.
    pub name: String,

    /// File holding registered devices.
    pub devices_file: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Number of dispatcher worker tasks.
    pub workers: usize,

    /// Capacity of the shared intake queue.
    pub intake_queue: usize,

    /// Seconds between periodic device saves (0 = only on shutdown).
    pub save_interval_secs: u64,
}

/// Device onboarding settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OnboardingConfig {
    /// Maximum number of pending key exchanges kept in memory.
    pub key_exchange_cache_size: usize,
}

/// One UDP transport instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UdpTransportConfig {
    /// Local address to bind.
    pub listen: String,

    /// Receive buffer size; longer datagrams are truncated.
    pub max_packet_size: usize,

    /// Where outgoing datagrams go. Without it nothing is sent back.
    pub gateway: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Open IoT Server".to_string(),
            devices_file: default_data_dir().join("devices.toml"),
            log_level: "info".to_string(),
            workers: 2,
            intake_queue: 256,
            save_interval_secs: 60,
        }
    }
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            key_exchange_cache_size: 128,
        }
    }
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            gateway: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("openiot")
        .join("gateway.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("openiot")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - OPENIOT_SERVER_NAME: Override the announced server name
    /// - OPENIOT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - OPENIOT_WORKERS: Override the number of dispatcher workers
    /// - OPENIOT_DEVICES_FILE: Override the devices file location
    pub fn apply_env_overrides(&mut self) {
        if let Some(name) = non_empty_env("OPENIOT_SERVER_NAME") {
            tracing::info!("Overriding server name from environment: {}", name);
            self.server.name = name;
        }

        if let Some(level) = non_empty_env("OPENIOT_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.server.log_level = level;
        }

        if let Some(workers) = non_empty_env("OPENIOT_WORKERS") {
            match workers.parse::<usize>() {
                Ok(workers) => {
                    tracing::info!("Overriding workers from environment: {}", workers);
                    self.server.workers = workers;
                }
                Err(_) => {
                    tracing::warn!("Ignoring non-numeric OPENIOT_WORKERS value: {}", workers);
                }
            }
        }

        if let Some(path) = non_empty_env("OPENIOT_DEVICES_FILE") {
            tracing::info!("Overriding devices_file from environment: {}", path);
            self.server.devices_file = PathBuf::from(path);
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::EmptyServerName);
        }

        if self.server.workers < 1 || self.server.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkers {
                got: self.server.workers,
            });
        }

        if self.server.intake_queue == 0 {
            return Err(ConfigError::InvalidIntakeQueue);
        }

        if self.onboarding.key_exchange_cache_size == 0 {
            return Err(ConfigError::InvalidCacheSize);
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        for (name, udp) in &self.udp {
            if udp.listen.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::InvalidListenAddress {
                    transport: name.clone(),
                    address: udp.listen.clone(),
                });
            }

            if udp.max_packet_size == 0 || udp.max_packet_size > MAX_UDP_PAYLOAD {
                return Err(ConfigError::InvalidPacketSize {
                    transport: name.clone(),
                    size: udp.max_packet_size,
                });
            }

            if let Some(gateway) = &udp.gateway {
                if !is_host_port(gateway) {
                    return Err(ConfigError::InvalidGatewayAddress {
                        transport: name.clone(),
                        address: gateway.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// `host:port` with a non-empty host and a numeric port. Hosts are resolved
/// when the transport is created, not here.
fn is_host_port(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
