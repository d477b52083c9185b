//! Configuration for the gateway emulator.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the gateway emulator.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

/// Identity announced in heartbeats.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// At most 8 bytes; it travels in a fixed-width field.
    pub id: String,
    /// Address the server should use to reach this gateway.
    #[serde(default = "default_ip")]
    pub ip: String,
    /// TCP port the command responder listens on.
    #[serde(default = "default_command_port")]
    pub port: u16,
    /// Topology version. Raise it to make the server re-read the descriptor.
    #[serde(default = "default_sequence")]
    pub sequence: u16,
}

/// Where the control server listens.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How the emulated nodes react.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BehaviorConfig {
    /// Local node ids that answer every operation with `ERROR`.
    #[serde(default)]
    pub fail_nodes: Vec<String>,
    /// Delay before answering a node operation, in milliseconds.
    #[serde(default)]
    pub reply_delay_ms: u64,
    /// Send a synthetic telemetry line this often, when set.
    #[serde(default)]
    pub telemetry_interval_secs: Option<u64>,
}

// Default values
fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_command_port() -> u16 {
    5001
}
fn default_sequence() -> u16 {
    1
}
fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    5000
}
fn default_heartbeat_interval() -> u64 {
    5
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (EMU__SECTION__KEY format)
    /// 2. The given file, or gateway-emulator.toml (if present)
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name("gateway-emulator").required(false),
        };
        let config = ConfigLoader::builder()
            .set_default("heartbeat_interval_secs", default_heartbeat_interval() as i64)?
            .add_source(file)
            .add_source(
                Environment::with_prefix("EMU")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
