// Error module
// One error type for startup, handoff and watcher failures

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;

/// Errors produced by the lifecycle subsystem.
///
/// Startup failures (`Bind`, `Inherit`, `Tls`, `Config`, `Signal`, `Logging`)
/// are fatal and abort the process. `Spawn` and `SpawnInProgress` are logged
/// by the lifecycle controller, which keeps the current generation serving.
/// `ConfigRead` is retried on the next watcher tick.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to recover inherited listener from fd {fd}: {reason}")]
    Inherit { fd: RawFd, reason: String },

    #[error("failed to spawn next generation: {0}")]
    Spawn(String),

    #[error("a generation handoff is already in progress")]
    SpawnInProgress,

    #[error("failed to read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
