// Configuration module entry point
// Loads layered settings and watches the config file for changes

mod types;
pub mod watcher;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::server::TlsPaths;

pub use types::{
    Config, LifecycleConfig, LimiterConfig, LoggingConfig, ServerConfig, TlsConfig, UpgradeConfig,
    WatcherConfig,
};
pub use watcher::{ConfigSnapshot, ConfigWatcher};

/// Environment variable prefix, e.g. `HANDOFF_SERVER__PORT=9090`
const ENV_PREFIX: &str = "HANDOFF";

impl Config {
    /// Load configuration from the given file, layered under `HANDOFF_*`
    /// environment variables. A missing file falls back to defaults.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(config_path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse raw TOML content, as read by the config watcher.
    pub fn from_toml(content: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if self.lifecycle.grace_timeout_secs == 0 {
            return Err(Error::Config(
                "lifecycle.grace_timeout_secs must be positive".to_string(),
            ));
        }
        if self.server.header_read_timeout_ms == 0 {
            return Err(Error::Config(
                "server.header_read_timeout_ms must be positive".to_string(),
            ));
        }
        if self.watcher.interval_ms == 0 {
            return Err(Error::Config(
                "watcher.interval_ms must be positive".to_string(),
            ));
        }
        match (&self.tls.cert_path, &self.tls.key_path) {
            (Some(_), None) | (None, Some(_)) => Err(Error::Config(
                "tls.cert_path and tls.key_path must be set together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {e}")))
    }

    pub fn tls_paths(&self) -> Option<TlsPaths> {
        match (&self.tls.cert_path, &self.tls.key_path) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        }
    }

    pub const fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.grace_timeout_secs)
    }

    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.ready_timeout_secs)
    }

    pub const fn header_read_timeout(&self) -> Duration {
        Duration::from_millis(self.server.header_read_timeout_ms)
    }

    pub const fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.interval_ms)
    }

    /// The file the config watcher should poll.
    pub fn watch_path(&self, config_path: &Path) -> PathBuf {
        self.watcher
            .path
            .clone()
            .unwrap_or_else(|| config_path.to_path_buf())
    }
}
