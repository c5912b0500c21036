// Configuration types module
// Defines all configuration-related data structures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub limiter: LimiterConfig,
    pub watcher: WatcherConfig,
    pub lifecycle: LifecycleConfig,
    pub upgrade: UpgradeConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Tokio worker threads; defaults to the number of CPU cores
    pub workers: Option<usize>,
    /// A connection that has not sent complete request headers within this
    /// window is closed and its admission slot released
    pub header_read_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: None,
            header_read_timeout_ms: 2000,
        }
    }
}

/// TLS certificate/key paths. TLS is enabled only when both are set.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// Admission limiter configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LimiterConfig {
    /// Maximum number of connections handled concurrently
    pub capacity: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Config change watcher configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// File to watch; the `--config` file when unset
    pub path: Option<PathBuf>,
    pub interval_ms: u64,
    /// Trigger a generation handoff when the watched file changes
    pub restart_on_change: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            interval_ms: 1000,
            restart_on_change: true,
        }
    }
}

/// Shutdown and handoff timing
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Grace period for draining in-flight connections
    pub grace_timeout_secs: u64,
    /// How long the parent waits for the next generation to report it is accepting
    pub ready_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_timeout_secs: 20,
            ready_timeout_secs: 10,
        }
    }
}

/// Executable upgrade detection
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Trigger a handoff when the server binary on disk is replaced
    pub watch_binary: bool,
    pub interval_secs: u64,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            watch_binary: false,
            interval_secs: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// Append logs to this file instead of stdout
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
