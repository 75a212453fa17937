//! Application configuration structs
//!
//! Loads configuration from environment variables (and an optional `.env` file).

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app: AppSettings,
    pub upstream: UpstreamConfig,
    pub websocket: WebSocketConfig,
    pub liveness: LivenessConfig,
    /// Static file server; disabled when `None`
    pub http: Option<StaticConfig>,
}

/// General application settings
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub env: Environment,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Self::Production),
            "staging" => Ok(Self::Staging),
            "development" => Ok(Self::Development),
            _ => Err(()),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the upstream link does with writes while it is not connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OfflinePolicy {
    /// Discard the write
    #[default]
    Drop,
    /// Hold it in a bounded queue and flush on the next connection
    Queue,
}

impl FromStr for OfflinePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "queue" => Ok(Self::Queue),
            _ => Err(()),
        }
    }
}

/// Reconnection policy for the upstream link
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failures tolerated before giving up; `None` retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    /// Never reconnect
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            initial_delay_ms: default_reconnect_initial_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            max_attempts: None,
        }
    }
}

/// Upstream TCP link configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_host")]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub offline_policy: OfflinePolicy,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Terminate every outbound write with `\n`
    #[serde(default)]
    pub append_newline: bool,
}

impl UpstreamConfig {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            reconnect: ReconnectConfig::default(),
            offline_policy: OfflinePolicy::default(),
            queue_capacity: default_queue_capacity(),
            append_newline: false,
        }
    }
}

/// WebSocket endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    pub server: ServerConfig,
    /// Outbound messages buffered per client before fan-out waits on it
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

/// Liveness sweep configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl LivenessConfig {
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

/// Static file server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    pub server: ServerConfig,
    pub root: PathBuf,
}

// Default value functions
fn default_app_name() -> String {
    "tcp-ws-bridge".to_string()
}

fn default_env() -> Environment {
    Environment::Development
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_upstream_port() -> u16 {
    1998
}

fn default_ws_port() -> u16 {
    8888
}

fn default_http_port() -> u16 {
    8080
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_client_buffer() -> usize {
    256
}

fn default_ping_interval_secs() -> u64 {
    30
}

/// Reads one variable through `lookup`, falling back to `default` when unset
fn parse_var<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, raw)),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key, raw)),
        },
        None => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if a variable is present but cannot be parsed
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = match lookup("APP_ENV") {
            Some(raw) => raw
                .parse()
                .map_err(|()| ConfigError::InvalidValue("APP_ENV", raw))?,
            None => default_env(),
        };

        let offline_policy = match lookup("UPSTREAM_OFFLINE_POLICY") {
            Some(raw) => raw
                .parse()
                .map_err(|()| ConfigError::InvalidValue("UPSTREAM_OFFLINE_POLICY", raw))?,
            None => OfflinePolicy::default(),
        };

        let max_attempts = match lookup("UPSTREAM_RECONNECT_MAX_ATTEMPTS") {
            Some(raw) => Some(
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("UPSTREAM_RECONNECT_MAX_ATTEMPTS", raw))?,
            ),
            None => None,
        };

        let ping_interval_secs = parse_var(&lookup, "PING_INTERVAL_SECS", default_ping_interval_secs())?;
        if ping_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("PING_INTERVAL_SECS", "0".to_string()));
        }

        let http = match lookup("STATIC_ROOT") {
            Some(root) => Some(StaticConfig {
                server: ServerConfig {
                    host: lookup("HTTP_HOST").unwrap_or_else(default_listen_host),
                    port: parse_var(&lookup, "HTTP_PORT", default_http_port())?,
                },
                root: PathBuf::from(root),
            }),
            None => None,
        };

        Ok(Self {
            app: AppSettings {
                name: lookup("APP_NAME").unwrap_or_else(default_app_name),
                env,
            },
            upstream: UpstreamConfig {
                host: lookup("UPSTREAM_HOST").unwrap_or_else(default_upstream_host),
                port: parse_var(&lookup, "UPSTREAM_PORT", default_upstream_port())?,
                reconnect: ReconnectConfig {
                    enabled: parse_bool(&lookup, "UPSTREAM_RECONNECT", default_reconnect_enabled())?,
                    initial_delay_ms: parse_var(
                        &lookup,
                        "UPSTREAM_RECONNECT_INITIAL_MS",
                        default_reconnect_initial_ms(),
                    )?,
                    max_delay_ms: parse_var(
                        &lookup,
                        "UPSTREAM_RECONNECT_MAX_MS",
                        default_reconnect_max_ms(),
                    )?,
                    max_attempts,
                },
                offline_policy,
                queue_capacity: parse_var(&lookup, "UPSTREAM_QUEUE_CAPACITY", default_queue_capacity())?,
                append_newline: parse_bool(&lookup, "UPSTREAM_APPEND_NEWLINE", false)?,
            },
            websocket: WebSocketConfig {
                server: ServerConfig {
                    host: lookup("WS_HOST").unwrap_or_else(default_listen_host),
                    port: parse_var(&lookup, "WS_PORT", default_ws_port())?,
                },
                client_buffer: parse_var(&lookup, "WS_CLIENT_BUFFER", default_client_buffer())?,
            },
            liveness: LivenessConfig { ping_interval_secs },
            http,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
