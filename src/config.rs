//! # Configuration Management
//!
//! Centralized configuration for servers and clients speaking the protocol.
//!
//! ## Configuration Sources
//! - TOML files via [`ProtocolConfig::from_file`]
//! - Direct instantiation with defaults
//! - Environment overrides via [`ProtocolConfig::from_env`] (`REBORN_*`)
//!
//! Durations are written as milliseconds and log levels as lowercase
//! strings.
//!
//! ## Security Considerations
//! - Frame and payload ceilings bound memory per connection
//! - The handshake timeout keeps idle sockets from holding a slot
//! - Unknown client versions are rejected unless explicitly allowed

use crate::core::frame::Framing;
use crate::error::{ProtocolError, Result};
use crate::utils::compression::{CompressionPolicy, DEFAULT_LEVEL, DEFAULT_THRESHOLD_BYTES};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Largest frame accepted on the wire (bytes, before unstuffing).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Largest plaintext a single frame may decompress to.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default listen port of the legacy game server.
pub const DEFAULT_PORT: u16 = 14900;

/// Version tokens of the clients this crate is known to interoperate with.
pub const DEFAULT_ACCEPTED_VERSIONS: [&str; 3] = ["G3D0311C", "G3D0511C", "GNW03014"];

/// Version token sent by the client connector by default.
pub const DEFAULT_CLIENT_VERSION: &str = "G3D0511C";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProtocolConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProtocolConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `REBORN_*` overrides read through `lookup`.
    ///
    /// Unparseable values are ignored and leave the current setting in place.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("REBORN_SERVER_ADDRESS") {
            self.server.address = addr;
        }

        if let Some(addr) = lookup("REBORN_CLIENT_ADDRESS") {
            self.client.address = addr;
        }

        if let Some(val) = lookup("REBORN_BACKPRESSURE_LIMIT").and_then(|v| v.parse().ok()) {
            self.server.backpressure_limit = val;
        }

        if let Some(val) = lookup("REBORN_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.server.max_connections = val;
        }

        if let Some(val) = lookup("REBORN_HANDSHAKE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.server.handshake_timeout = Duration::from_millis(val);
        }

        if let Some(val) = lookup("REBORN_MAX_FRAME_SIZE").and_then(|v| v.parse().ok()) {
            self.transport.max_frame_size = val;
        }

        if let Some(val) = lookup("REBORN_COMPRESSION_ENABLED").and_then(|v| v.parse().ok()) {
            self.transport.compression_enabled = val;
        }

        if let Some(framing) = lookup("REBORN_FRAMING") {
            match framing.as_str() {
                "delimited" => self.transport.framing = Framing::Delimited,
                "length_prefixed" => self.transport.framing = Framing::LengthPrefixed,
                _ => {}
            }
        }

        if let Some(level) = lookup("REBORN_LOG_LEVEL").and_then(|v| v.parse().ok()) {
            self.logging.log_level = level;
        }
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "0.0.0.0:14900")
    pub address: String,

    /// Maximum number of packets waiting in a connection's outbound queue
    pub backpressure_limit: usize,

    /// Time a new connection has to deliver its handshake
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            backpressure_limit: 256,
            handshake_timeout: timeout::DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:14900')",
                self.address
            ));
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        } else if self.backpressure_limit > 1_000_000 {
            errors.push(format!(
                "Backpressure limit too large: {} (max recommended: 1,000,000)",
                self.backpressure_limit
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Version token announced in the handshake
    pub protocol_version: String,

    /// Whether to request an encrypted session
    pub encrypt: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            protocol_version: DEFAULT_CLIENT_VERSION.to_string(),
            encrypt: true,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.protocol_version.len() != 8 || !self.protocol_version.is_ascii() {
            errors.push(format!(
                "Client protocol version must be 8 ASCII characters: '{}'",
                self.protocol_version
            ));
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Frame delimiting on the byte stream
    #[serde(default)]
    pub framing: Framing,

    /// Maximum frame size on the wire in bytes
    pub max_frame_size: usize,

    /// Maximum plaintext size a frame may decompress to
    pub max_payload_size: usize,

    /// Whether outbound frames may be compressed
    pub compression_enabled: bool,

    /// Compression level for zlib and bzip2 (1-9)
    pub compression_level: u32,

    /// Minimum payload size (bytes) before compression is attempted
    #[serde(default = "default_threshold")]
    pub compression_threshold_bytes: usize,

    /// Whether handshakes asking for an unencrypted session are refused
    pub encryption_required: bool,

    /// Client version tokens accepted during the handshake
    pub accepted_versions: Vec<String>,

    /// Whether a token missing from `accepted_versions` fails the handshake
    pub reject_unknown_versions: bool,
}

fn default_threshold() -> usize {
    DEFAULT_THRESHOLD_BYTES
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Delimited,
            max_frame_size: MAX_FRAME_SIZE,
            max_payload_size: MAX_PAYLOAD_SIZE,
            compression_enabled: true,
            compression_level: DEFAULT_LEVEL,
            compression_threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            encryption_required: true,
            accepted_versions: DEFAULT_ACCEPTED_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            reject_unknown_versions: true,
        }
    }
}

impl TransportConfig {
    /// Outbound compression policy derived from these settings.
    pub fn compression_policy(&self) -> CompressionPolicy {
        CompressionPolicy {
            enabled: self.compression_enabled,
            threshold_bytes: self.compression_threshold_bytes,
            level: self.compression_level,
        }
    }

    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 16 {
            errors.push("Max frame size too small (minimum: 16 bytes)".to_string());
        } else if self.framing == Framing::LengthPrefixed
            && self.max_frame_size > u16::MAX as usize + 1
        {
            errors.push(format!(
                "Max frame size {} exceeds the 16-bit length prefix",
                self.max_frame_size
            ));
        }

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.compression_enabled {
            if !(1..=9).contains(&self.compression_level) {
                errors.push(format!(
                    "Invalid compression level: {} (valid range: 1-9)",
                    self.compression_level
                ));
            }

            if self.compression_threshold_bytes > self.max_frame_size {
                errors
                    .push("Compression threshold cannot be larger than max frame size".to_string());
            }
        }

        if self.reject_unknown_versions && self.accepted_versions.is_empty() {
            errors.push(
                "accepted_versions cannot be empty when reject_unknown_versions is set".to_string(),
            );
        }

        for version in &self.accepted_versions {
            if version.len() != 8 || !version.is_ascii() {
                errors.push(format!(
                    "Accepted version must be 8 ASCII characters: '{version}'"
                ));
            }
        }

        if !self.encryption_required {
            errors.push(
                "WARNING: Unencrypted sessions are accepted - not recommended for production"
                    .to_string(),
            );
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("reborn-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
