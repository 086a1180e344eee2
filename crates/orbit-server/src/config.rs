//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (`ORBIT_CONFIG`, or the first of the default paths)
//! - Environment variables (`ORBIT__SECTION__KEY`, plus `ORBIT_HOST` / `ORBIT_PORT`)

use anyhow::{Context, Result};
use orbit_bus::{topic::default_bindings, PublisherConfig, ReceiverConfig};
use orbit_core::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Handshake authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Message bus.
    #[serde(default)]
    pub bus: BusConfig,

    /// Presence behaviour.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Handshake authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Query parameter carrying the bearer token.
    #[serde(default = "default_token_param")]
    pub token_param: String,

    /// Deadline for token validation in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// HMAC secret for HS256 tokens.
    #[serde(default)]
    pub jwt_secret: String,

    /// Clock skew tolerated on `exp`, in seconds.
    #[serde(default)]
    pub leeway_secs: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum rooms a single connection may join.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Message bus backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process exchange. Only this instance sees its events.
    Memory,
    /// Redis pub/sub.
    Redis,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Backend to use.
    #[serde(default = "default_backend")]
    pub backend: BusBackend,

    /// Broker URL for networked backends.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// First word of every routing key.
    #[serde(default = "default_routing_prefix")]
    pub routing_prefix: String,

    /// Application id stamped on published messages.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Binding patterns for the receiver. Empty means every presence topic.
    #[serde(default)]
    pub bindings: Vec<String>,

    /// Drop deliveries this instance published itself.
    #[serde(default)]
    pub skip_own_events: bool,

    /// First resubscribe delay in milliseconds.
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_ms: u64,

    /// Largest resubscribe delay in milliseconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Drop bus status events older than one already rebroadcast for the same user.
    #[serde(default)]
    pub reject_stale_events: bool,

    /// How long a user is remembered by the stale check after their last status event.
    #[serde(default = "default_stale_window_ms")]
    pub stale_window_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            reject_stale_events: false,
            stale_window_ms: default_stale_window_ms(),
        }
    }
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

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_token_param() -> String {
    "token".to_string()
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_max_rooms() -> usize {
    256
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_backend() -> BusBackend {
    BusBackend::Memory
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_routing_prefix() -> String {
    "events".to_string()
}

fn default_app_id() -> String {
    "orbit".to_string()
}

fn default_reconnect_min() -> u64 {
    100
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_stale_window_ms() -> u64 {
    300_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            bus: BusConfig::default(),
            presence: PresenceConfig::default(),
            metrics: MetricsConfig::default(),
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

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_param: default_token_param(),
            handshake_timeout_ms: default_handshake_timeout(),
            jwt_secret: String::new(),
            leeway_secs: 0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: default_max_rooms(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_bus_url(),
            routing_prefix: default_routing_prefix(),
            app_id: default_app_id(),
            bindings: Vec::new(),
            skip_own_events: false,
            reconnect_min_ms: default_reconnect_min(),
            reconnect_max_ms: default_reconnect_max(),
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
    /// Load configuration from file, environment and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("ORBIT_CONFIG").ok().map(PathBuf::from);
        let path = explicit.or_else(find_config_file);
        Self::load_from(path.as_deref())
    }

    /// Load configuration from a specific file (if any) layered with the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ORBIT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .and_then(|built| built.try_deserialize::<Config>())
            .with_context(|| match path {
                Some(path) => format!("Failed to load config file: {}", path.display()),
                None => "Failed to load configuration".to_string(),
            })?;

        config.apply_env_shortcuts()?;
        Ok(config)
    }

    fn apply_env_shortcuts(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("ORBIT_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("ORBIT_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid ORBIT_PORT: {port}"))?;
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Registry settings.
    #[must_use]
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            max_rooms_per_connection: self.limits.max_rooms_per_connection,
            ..RegistryConfig::default()
        }
    }

    /// Publisher settings.
    #[must_use]
    pub fn publisher(&self) -> PublisherConfig {
        PublisherConfig {
            routing_prefix: self.bus.routing_prefix.clone(),
            app_id: self.bus.app_id.clone(),
        }
    }

    /// Receiver settings.
    #[must_use]
    pub fn receiver(&self) -> ReceiverConfig {
        let bindings = if self.bus.bindings.is_empty() {
            default_bindings(&self.bus.routing_prefix)
        } else {
            self.bus.bindings.clone()
        };
        ReceiverConfig {
            bindings,
            skip_own_events: self.bus.skip_own_events,
            reject_stale_events: self.presence.reject_stale_events,
            stale_window: Duration::from_millis(self.presence.stale_window_ms),
            reconnect_min: Duration::from_millis(self.bus.reconnect_min_ms),
            reconnect_max: Duration::from_millis(self.bus.reconnect_max_ms),
        }
    }

    /// Handshake validation deadline.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.handshake_timeout_ms)
    }
}

fn find_config_file() -> Option<PathBuf> {
    let config_paths = [
        "orbit.toml",
        "/etc/orbit/orbit.toml",
        "~/.config/orbit/orbit.toml",
    ];

    config_paths
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}
