// Binary upgrade watcher
// Requests a restart when the server executable on disk is replaced

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::signal::SignalEvent;
use crate::error::Result;

/// Polls the executable's modification time.
///
/// A newer timestamp enqueues a `Restart` event, so an upgrade goes through
/// the same single-flight handoff and drain as SIGHUP.
#[derive(Debug)]
pub struct BinaryWatcher {
    path: PathBuf,
    baseline: Option<SystemTime>,
}

impl BinaryWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let baseline = modified(&path);
        Self { path, baseline }
    }

    /// Watch the running executable, resolved now so a later rename-over
    /// is still observed at the original path.
    pub fn for_current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Whether the binary was replaced since the last poll.
    ///
    /// A missing file is skipped: it is usually mid-replacement.
    pub fn poll(&mut self) -> bool {
        let Some(current) = modified(&self.path) else {
            return false;
        };
        match self.baseline {
            Some(seen) if current <= seen => false,
            _ => {
                self.baseline = Some(current);
                true
            }
        }
    }

    /// Poll on `interval`; stops once the lifecycle no longer accepts events.
    pub fn watch(mut self, interval: Duration, events: mpsc::Sender<SignalEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(path = %self.path.display(), "binary upgrade watcher started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !self.poll() {
                    continue;
                }
                tracing::info!(path = %self.path.display(), "new server binary detected, requesting restart");
                if events.send(SignalEvent::Restart).await.is_err() {
                    break;
                }
            }
        })
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
