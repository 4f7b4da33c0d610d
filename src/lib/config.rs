//! Layered settings: built-in defaults, then an optional file, then the
//! environment (`POLLBUS_<SECTION>__<KEY>`, e.g. `POLLBUS_SERVER__PORT=9000`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::adapters::HttpConfig;
use crate::core::{RetentionPolicy, TraversalOrder};

const ENV_PREFIX: &str = "POLLBUS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
    /// Used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            broker: BrokerSettings::default(),
            storage: StorageSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// TLS is enabled when both paths are set.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        Some((self.tls_cert.clone()?, self.tls_key.clone()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub poll_timeout_secs: u64,
    pub recheck_interval_ms: u64,
    pub sweep_interval_secs: u64,
    /// Ttl for publishes without one; `0` keeps them until deleted.
    pub default_ttl_secs: u64,
    /// `0` means unbounded.
    pub max_messages_per_channel: usize,
    pub default_order: TraversalOrder,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 30,
            recheck_interval_ms: 1000,
            sweep_interval_secs: 5,
            default_ttl_secs: 0,
            max_messages_per_channel: 0,
            default_order: TraversalOrder::Fifo,
        }
    }
}

impl BrokerSettings {
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_messages: (self.max_messages_per_channel > 0)
                .then_some(self.max_messages_per_channel),
            default_ttl: (self.default_ttl_secs > 0)
                .then(|| Duration::from_secs(self.default_ttl_secs)),
        }
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            recheck_interval: Duration::from_millis(self.recheck_interval_ms.max(1)),
            default_order: self.default_order,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Database file for the sqlite backend.
    pub path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: "pollbus.db".to_string(),
        }
    }
}

/// Loads `config/default.{toml,yaml,json,...}` if present, then the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    build(File::with_name("config/default").required(false))
}

/// Loads the given file, which must exist, then the environment.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    build(File::from(path.as_ref()).required(true))
}

fn build<F>(file: F) -> Result<Settings, ConfigError>
where
    F: config::Source + Send + Sync + 'static,
{
    Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
