//! Configuration structs

mod app_config;

pub use app_config::{
    AppConfig, AppSettings, ConfigError, Environment, LivenessConfig, OfflinePolicy,
    ReconnectConfig, ServerConfig, StaticConfig, UpstreamConfig, WebSocketConfig,
};
