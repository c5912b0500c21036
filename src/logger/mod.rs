//! Logger module
//!
//! Provides logging utilities for the server including:
//! - Subscriber setup from the `[logging]` config section
//! - Generation and lifecycle transition logging
//! - Connection and admission logging

pub mod writer;

use std::net::SocketAddr;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use crate::server::{Generation, LifecycleState};

/// Initialize the global tracing subscriber
///
/// Should be called once at application startup. `RUST_LOG` takes
/// precedence over `logging.level`.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Logging(format!("invalid filter '{}': {e}", config.level)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match &config.file {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(writer::open_log_file(path)?)
            .try_init(),
        None => builder.try_init(),
    };
    installed.map_err(|e| Error::Logging(e.to_string()))
}

pub fn log_server_start(addr: &SocketAddr, generation: &Generation, tls: bool) {
    tracing::info!(
        %addr,
        pid = generation.pid,
        inherited = generation.inherited,
        tls,
        "server accepting connections"
    );
    tracing::info!(
        "send SIGHUP to pid {} to restart without dropping connections",
        generation.pid
    );
}

pub fn log_transition(from: LifecycleState, to: LifecycleState) {
    tracing::info!(%from, %to, "lifecycle transition");
}

pub fn log_handoff_complete(successor: u32) {
    tracing::info!(successor, "next generation is accepting, retiring this one");
}

pub fn log_handoff_failed(err: &Error) {
    tracing::error!(error = %err, "handoff failed, continuing to serve");
}

pub fn log_drain_started(grace: Duration) {
    tracing::info!(grace_secs = grace.as_secs_f64(), "draining in-flight connections");
}

pub fn log_drain_timeout(grace: Duration) {
    tracing::warn!(
        grace_secs = grace.as_secs_f64(),
        "drain timeout exceeded, closing remaining connections"
    );
}

pub fn log_admission_rejected(peer_addr: &SocketAddr, capacity: usize) {
    tracing::warn!(peer = %peer_addr, capacity, "admission limit reached, connection rejected");
}

pub fn log_connection_error(peer_addr: &SocketAddr, err: &impl std::fmt::Display) {
    tracing::debug!(peer = %peer_addr, error = %err, "connection ended with error");
}

pub fn log_accept_error(err: &std::io::Error) {
    tracing::error!(error = %err, "failed to accept connection");
}
