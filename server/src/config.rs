//! Configuration for the control server.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the control server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timers: TimersConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ftp: FtpConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening address; the UDP heartbeat socket and the TCP command socket share it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Intervals of every periodic task, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimersConfig {
    /// A gateway silent for longer than this is evicted.
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout: u64,
    #[serde(default = "default_gateway_sweep")]
    pub gateway_sweep: u64,
    #[serde(default = "default_poll")]
    pub node_types_poll: u64,
    #[serde(default = "default_poll")]
    pub locations_poll: u64,
    #[serde(default = "default_poll")]
    pub slots_start_poll: u64,
    #[serde(default = "default_poll")]
    pub slots_end_poll: u64,
    /// How far ahead slot start/end detection looks.
    #[serde(default = "default_slot_lookahead")]
    pub slot_lookahead: u64,
    /// Maximum age of an experiment log.
    #[serde(default = "default_log_retention")]
    pub log_retention: u64,
    #[serde(default = "default_log_sweep")]
    pub log_sweep: u64,
    /// Pending gateway groups older than this are flushed with partial results.
    /// Unset means groups wait for every gateway indefinitely.
    #[serde(default)]
    pub gateway_reply_timeout: Option<u64>,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            gateway_timeout: default_gateway_timeout(),
            gateway_sweep: default_gateway_sweep(),
            node_types_poll: default_poll(),
            locations_poll: default_poll(),
            slots_start_poll: default_poll(),
            slots_end_poll: default_poll(),
            slot_lookahead: default_slot_lookahead(),
            log_retention: default_log_retention(),
            log_sweep: default_log_sweep(),
            gateway_reply_timeout: None,
        }
    }
}

impl TimersConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout)
    }

    pub fn gateway_sweep(&self) -> Duration {
        Duration::from_secs(self.gateway_sweep)
    }

    pub fn node_types_poll(&self) -> Duration {
        Duration::from_secs(self.node_types_poll)
    }

    pub fn locations_poll(&self) -> Duration {
        Duration::from_secs(self.locations_poll)
    }

    pub fn slots_start_poll(&self) -> Duration {
        Duration::from_secs(self.slots_start_poll)
    }

    pub fn slots_end_poll(&self) -> Duration {
        Duration::from_secs(self.slots_end_poll)
    }

    pub fn slot_lookahead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.slot_lookahead as i64)
    }

    pub fn log_retention(&self) -> Duration {
        Duration::from_secs(self.log_retention)
    }

    pub fn log_sweep(&self) -> Duration {
        Duration::from_secs(self.log_sweep)
    }

    pub fn gateway_reply_timeout(&self) -> Option<Duration> {
        self.gateway_reply_timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Where pulled gateway descriptors are stored.
    #[serde(default = "default_gateways_dir")]
    pub gateways_dir: PathBuf,
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,
    #[serde(default = "default_erase_images_dir")]
    pub erase_images_dir: PathBuf,
    #[serde(default = "default_experiments_dir")]
    pub experiments_dir: PathBuf,
    #[serde(default = "default_node_types_file")]
    pub node_types_file: PathBuf,
    #[serde(default = "default_locations_file")]
    pub locations_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            gateways_dir: default_gateways_dir(),
            images_dir: default_images_dir(),
            erase_images_dir: default_erase_images_dir(),
            experiments_dir: default_experiments_dir(),
            node_types_file: default_node_types_file(),
            locations_file: default_locations_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FtpConfig {
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            port: default_ftp_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC key used to sign bearer tokens.
    #[serde(default = "default_secret")]
    pub secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
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

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_gateway_timeout() -> u64 {
    30
}
fn default_gateway_sweep() -> u64 {
    10
}
fn default_poll() -> u64 {
    30
}
fn default_slot_lookahead() -> u64 {
    60
}
fn default_log_retention() -> u64 {
    7 * 24 * 60 * 60
}
fn default_log_sweep() -> u64 {
    60 * 60
}
fn default_database_url() -> String {
    "sqlite:./data/wsn.db".to_string()
}
fn default_gateways_dir() -> PathBuf {
    PathBuf::from("gateways")
}
fn default_images_dir() -> PathBuf {
    PathBuf::from("images")
}
fn default_erase_images_dir() -> PathBuf {
    PathBuf::from("images/erase")
}
fn default_experiments_dir() -> PathBuf {
    PathBuf::from("experiments")
}
fn default_node_types_file() -> PathBuf {
    PathBuf::from("nodetypes.xml")
}
fn default_locations_file() -> PathBuf {
    PathBuf::from("locations.xml")
}
fn default_ftp_port() -> u16 {
    21
}
fn default_secret() -> String {
    "change-me".to_string()
}
fn default_token_ttl_hours() -> i64 {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (WSN__SECTION__KEY format)
    /// 2. The given file, or wsn-server.toml (if present)
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name("wsn-server").required(false),
        };
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("logging.level", default_log_level())?
            .add_source(file)
            .add_source(
                Environment::with_prefix("WSN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timers() {
        let timers = TimersConfig::default();
        assert_eq!(timers.gateway_timeout(), Duration::from_secs(30));
        assert_eq!(timers.slot_lookahead(), chrono::Duration::seconds(60));
        assert_eq!(timers.log_retention(), Duration::from_secs(604_800));
        assert!(timers.gateway_reply_timeout().is_none());
    }

    #[test]
    fn test_default_server_addr() {
        assert_eq!(ServerConfig::default().addr(), "0.0.0.0:5000");
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wsn.toml");
        std::fs::write(
            &path,
            "[server]\nport = 6000\n\n[timers]\ngateway_timeout = 5\ngateway_reply_timeout = 20\n",
        )
        .unwrap();

        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.timers.gateway_timeout, 5);
        assert_eq!(config.timers.gateway_sweep, 10);
        assert_eq!(
            config.timers.gateway_reply_timeout(),
            Some(Duration::from_secs(20))
        );
        assert_eq!(config.auth.token_ttl_hours, 8);
    }
}
