//! Server configuration.
//!
//! Configuration is layered:
//! - Defaults
//! - The first TOML file found at `rapport.toml`, `/etc/rapport/rapport.toml`
//!   or `~/.config/rapport/rapport.toml`
//! - Environment variables (`RAPPORT_PORT`, `RAPPORT_STORAGE__PATH`, ...)

use anyhow::{Context, Result};
use rapport_core::{BusConfig, ConversationConfig, PresenceConfig, TypingConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "rapport.toml",
    "/etc/rapport/rapport.toml",
    "~/.config/rapport/rapport.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat and presence configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Typing indicator configuration.
    #[serde(default)]
    pub typing: TypingSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file, or `:memory:`.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Buffered events per scope before slow subscribers lag.
    #[serde(default = "default_scope_capacity")]
    pub scope_capacity: usize,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum message body length in bytes.
    #[serde(default = "default_max_body_len")]
    pub max_body_len: usize,

    /// Maximum messages per history page.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval clients should ping at, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Silence after which a connection is dropped and its presence
    /// expires, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,

    /// How often stale presence is pruned, in milliseconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingSettings {
    /// Pings closer together than this are coalesced, in milliseconds.
    #[serde(default = "default_typing_throttle")]
    pub throttle_ms: u64,

    /// Receiver-side expiry, in milliseconds.
    #[serde(default = "default_typing_expiry")]
    pub expiry_ms: u64,

    /// How often throttle state is swept, in milliseconds.
    #[serde(default = "default_typing_sweep")]
    pub sweep_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_storage_path() -> String {
    "rapport.db".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_subscriptions() -> usize {
    256
}

fn default_scope_capacity() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_body_len() -> usize {
    4096
}

fn default_max_page_size() -> usize {
    200
}

fn default_heartbeat_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_heartbeat_timeout() -> u64 {
    45_000 // 45 seconds
}

fn default_reap_interval() -> u64 {
    15_000
}

fn default_typing_throttle() -> u64 {
    500
}

fn default_typing_expiry() -> u64 {
    1500
}

fn default_typing_sweep() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            storage: StorageConfig::default(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            typing: TypingSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            scope_capacity: default_scope_capacity(),
            max_frame_size: default_max_frame_size(),
            max_body_len: default_max_body_len(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            reap_interval_ms: default_reap_interval(),
        }
    }
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            throttle_ms: default_typing_throttle(),
            expiry_ms: default_typing_expiry(),
            sweep_interval_ms: default_typing_sweep(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// `RAPPORT_*` environment variables.
    ///
    /// Nested keys use a double underscore: `RAPPORT_LIMITS__MAX_CONNECTIONS`.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or a value has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = Self::find_file() {
            tracing::debug!(path = %path.display(), "Using config file");
            builder = builder.add_source(
                config::File::from(path.as_path()).format(config::FileFormat::Toml),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("RAPPORT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// The first existing config file, if any.
    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Bus settings.
    pub fn bus(&self) -> BusConfig {
        BusConfig {
            max_subscriptions_per_connection: self.limits.max_subscriptions_per_connection,
            scope_capacity: self.limits.scope_capacity,
        }
    }

    /// Conversation log settings.
    pub fn conversation(&self) -> ConversationConfig {
        ConversationConfig {
            max_body_len: self.limits.max_body_len,
            max_page_size: self.limits.max_page_size,
            ..ConversationConfig::default()
        }
    }

    /// Presence settings; the presence TTL is the heartbeat timeout.
    pub fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            ttl: Duration::from_millis(self.heartbeat.timeout_ms),
            reap_interval: Duration::from_millis(self.heartbeat.reap_interval_ms),
        }
    }

    /// Typing settings.
    pub fn typing(&self) -> TypingConfig {
        TypingConfig {
            throttle: Duration::from_millis(self.typing.throttle_ms),
            expiry: Duration::from_millis(self.typing.expiry_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.storage.path, "rapport.db");
        assert!(config.typing().throttle < config.typing().expiry);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [storage]
            path = ":memory:"

            [limits]
            max_connections = 50000

            [heartbeat]
            timeout_ms = 30000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.storage.path, ":memory:");
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_page_size, 200);
        assert_eq!(config.presence().ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("rapport-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "port = 7000\n[typing]\nthrottle_ms = 250\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.typing().throttle, Duration::from_millis(250));
        assert!(Config::from_file(&path).is_err());
    }
}
