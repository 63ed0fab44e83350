//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`air.toml`, `/etc/air/air.toml`, `~/.config/air/air.toml`)
//! - Environment overrides (`AIR__PORT`, `AIR__DATABASE__URL`, ...)
//! - Legacy environment variables used as defaults (`AIR_PORT`, `DB_HOST`, ...)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const CONFIG_PATHS: [&str; 3] = ["air.toml", "/etc/air/air.toml", "~/.config/air/air.toml"];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Dispatcher configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Access store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// MySQL connection, used by the `mysql` store backend.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Static assets.
    #[serde(default)]
    pub assets: AssetsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Pending requests held before producers wait.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Which access store backs room and token lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// MySQL tables `air_rooms`, `air_room_domains`, `air_api_tokens`.
    #[default]
    Mysql,
    /// In-process store seeded from `store.rooms`.
    Memory,
}

/// Access store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Rooms seeded into the memory backend.
    #[serde(default)]
    pub rooms: Vec<RoomSeed>,
}

/// A room seeded into the memory backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSeed {
    /// Room name.
    pub name: String,

    /// Largest accepted payload in bytes.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: u64,

    /// Whitelisted hostnames.
    #[serde(default)]
    pub domains: Vec<String>,

    /// API tokens bound to the room.
    #[serde(default)]
    pub tokens: Vec<TokenSeed>,
}

/// An API token seeded into the memory backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSeed {
    /// The bearer credential.
    pub token: String,

    /// Optional expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// MySQL connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL; overrides the individual fields.
    #[serde(default = "default_database_url")]
    pub url: Option<String>,

    /// Database host.
    #[serde(default = "default_db_host")]
    pub host: String,

    /// Database port.
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user.
    #[serde(default = "default_db_user")]
    pub user: String,

    /// Database password.
    #[serde(default = "default_db_password")]
    pub password: String,

    /// Database name.
    #[serde(default = "default_db_name")]
    pub name: String,

    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Seconds to wait for a pooled connection.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

/// Static asset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Directory served at `/`.
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,

    /// File under `public_dir` served at `/air.js`.
    #[serde(default = "default_client_script")]
    pub client_script: String,

    /// `Cache-Control` max-age for the client script, in seconds.
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age: u64,
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

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

// Default value functions
fn default_host() -> String {
    env_or("AIR_HOST", "0.0.0.0")
}

fn default_port() -> u16 {
    env_parse_or("AIR_PORT", 8181)
}

fn default_queue_capacity() -> usize {
    air_core::DEFAULT_QUEUE_CAPACITY
}

fn default_max_payload_size() -> u64 {
    64 * 1024
}

fn default_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty())
}

fn default_db_host() -> String {
    env_or("DB_HOST", "localhost")
}

fn default_db_port() -> u16 {
    env_parse_or("DB_PORT", 3306)
}

fn default_db_user() -> String {
    env_or("DB_USER", "air_user")
}

fn default_db_password() -> String {
    env_or("DB_PASSWORD", "")
}

fn default_db_name() -> String {
    env_or("DB_NAME", "air_production")
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    5
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("./public")
}

fn default_client_script() -> String {
    "air.prod.js".to_string()
}

fn default_cache_max_age() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dispatch: DispatchConfig::default(),
            store: StoreConfig::default(),
            database: DatabaseConfig::default(),
            assets: AssetsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: default_db_password(),
            name: default_db_name(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            public_dir: default_public_dir(),
            client_script: default_client_script(),
            cache_max_age: default_cache_max_age(),
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

impl DatabaseConfig {
    /// Connection URL, built from the individual fields unless `url` is set.
    #[must_use]
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.name
            ),
        }
    }
}

impl AssetsConfig {
    /// Path of the client script on disk.
    #[must_use]
    pub fn client_script_path(&self) -> PathBuf {
        self.public_dir.join(&self.client_script)
    }
}

impl Config {
    /// Load configuration from the first config file found, plus
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        let mut builder = config::Config::builder();
        if let Some(path) = &path {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }
        Self::build(builder)
            .with_context(|| format!("Failed to load config from {}", path.as_deref().unwrap_or("defaults")))
    }

    /// Load configuration from a specific file, plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let builder = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(true));
        Self::build(builder)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings = builder
            .add_source(
                Environment::with_prefix("AIR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml_str: &str) -> Config {
        config::Config::builder()
            .add_source(File::from_str(toml_str, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dispatch.queue_capacity, 100);
        assert_eq!(config.store.backend, StoreBackend::Mysql);
        assert_eq!(config.assets.client_script, "air.prod.js");
        assert_eq!(config.assets.cache_max_age, 3600);
        assert_eq!(
            config.assets.client_script_path(),
            PathBuf::from("./public/air.prod.js")
        );
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 8181;
        assert_eq!(config.bind_addr().unwrap().port(), 8181);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config = from_toml(
            r#"
            host = "127.0.0.1"
            port = 9000

            [dispatch]
            queue_capacity = 8

            [store]
            backend = "memory"

            [[store.rooms]]
            name = "lobby"
            max_payload_size = 4096
            domains = ["example.com"]
            tokens = [{ token = "secret" }, { token = "old", expires_at = "2020-01-01T00:00:00Z" }]
        "#,
        );

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.dispatch.queue_capacity, 8);
        assert_eq!(config.store.backend, StoreBackend::Memory);

        let lobby = &config.store.rooms[0];
        assert_eq!(lobby.max_payload_size, 4096);
        assert_eq!(lobby.domains, vec!["example.com"]);
        assert_eq!(lobby.tokens.len(), 2);
        assert!(lobby.tokens[0].expires_at.is_none());
        assert!(lobby.tokens[1].expires_at.is_some());
    }

    #[test]
    fn test_database_url() {
        let mut database = DatabaseConfig {
            url: None,
            host: "db".into(),
            port: 3307,
            user: "air".into(),
            password: "pw".into(),
            name: "air_test".into(),
            max_connections: 1,
            acquire_timeout_secs: 1,
        };
        assert_eq!(database.connection_url(), "mysql://air:pw@db:3307/air_test");

        database.url = Some("mysql://other/db".into());
        assert_eq!(database.connection_url(), "mysql://other/db");
    }
}
