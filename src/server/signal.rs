// Signal handling module
//
// Supported signals:
// - SIGHUP:  Restart with listener handoff
// - SIGTERM: Graceful shutdown
// - SIGINT:  Graceful shutdown (Ctrl+C)
// - SIGUSR1: Logged and ignored
// - SIGUSR2: Logged and ignored

use std::fmt;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Lifecycle request produced by the OS signal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Restart,
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shutdown"),
            Self::Restart => f.write_str("restart"),
        }
    }
}

struct Handlers {
    hangup: Signal,
    terminate: Signal,
    interrupt: Signal,
    user1: Signal,
    user2: Signal,
}

fn register(kind: SignalKind) -> Result<Signal> {
    signal(kind).map_err(Error::Signal)
}

/// Start the signal source.
///
/// Handlers are registered before this returns, so a signal delivered right
/// after startup is queued rather than killing the process. Events go to the
/// lifecycle controller through `events`; once the controller stops
/// listening, further signals are logged and dropped.
///
/// | Signal  | Event      |
/// |---------|------------|
/// | SIGHUP  | `Restart`  |
/// | SIGTERM | `Shutdown` |
/// | SIGINT  | `Shutdown` |
/// | SIGUSR1 | (ignored)  |
/// | SIGUSR2 | (ignored)  |
pub fn start_signal_handler(events: mpsc::Sender<SignalEvent>) -> Result<JoinHandle<()>> {
    let mut handlers = Handlers {
        hangup: register(SignalKind::hangup())?,
        terminate: register(SignalKind::terminate())?,
        interrupt: register(SignalKind::interrupt())?,
        user1: register(SignalKind::user_defined1())?,
        user2: register(SignalKind::user_defined2())?,
    };

    tracing::info!(
        pid = std::process::id(),
        "signal handlers registered: HUP restarts, TERM/INT shut down"
    );

    Ok(tokio::spawn(async move {
        loop {
            let (name, event) = tokio::select! {
                _ = handlers.hangup.recv() => ("SIGHUP", Some(SignalEvent::Restart)),
                _ = handlers.terminate.recv() => ("SIGTERM", Some(SignalEvent::Shutdown)),
                _ = handlers.interrupt.recv() => ("SIGINT", Some(SignalEvent::Shutdown)),
                _ = handlers.user1.recv() => ("SIGUSR1", None),
                _ = handlers.user2.recv() => ("SIGUSR2", None),
            };

            let Some(event) = event else {
                tracing::info!(signal = name, "signal has no lifecycle action, ignoring");
                continue;
            };

            tracing::info!(signal = name, %event, "signal received");
            if events.send(event).await.is_err() {
                tracing::info!(signal = name, "lifecycle is no longer accepting signals, ignoring");
            }
        }
    }))
}
