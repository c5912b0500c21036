// Serving engine module
// Owns the accept loop and every connection task of one generation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use super::handler::Handler;
use super::lifecycle::ServingEngine;
use super::limiter::AdmissionLimiter;
use super::server_loop::start_server_loop;

/// State shared by the accept loop and the connection tasks.
pub struct EngineShared {
    pub limiter: Arc<AdmissionLimiter>,
    pub handler: Handler,
    pub tls: Option<TlsAcceptor>,
    /// Deadline for a connection to deliver its request headers
    pub header_read_timeout: Duration,
    /// Set once: stop accepting, finish in-flight requests
    pub stop: watch::Sender<bool>,
    /// Set once: abort every remaining connection
    pub kill: watch::Sender<bool>,
    /// In-flight connection count
    active: watch::Sender<usize>,
}

impl EngineShared {
    /// Count a connection as in flight until the guard drops.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        ConnectionGuard {
            shared: Arc::clone(self),
        }
    }
}

pub struct ConnectionGuard {
    shared: Arc<EngineShared>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shared.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// HTTP/1.1 serving engine for one generation.
pub struct HttpEngine {
    shared: Arc<EngineShared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl HttpEngine {
    /// Spawn the accept loop on `listener`. Must be called inside a tokio runtime.
    pub fn start(
        listener: TcpListener,
        limiter: Arc<AdmissionLimiter>,
        handler: Handler,
        tls: Option<TlsAcceptor>,
        header_read_timeout: Duration,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(EngineShared {
            limiter,
            handler,
            tls,
            header_read_timeout,
            stop: watch::Sender::new(false),
            kill: watch::Sender::new(false),
            active: watch::Sender::new(0),
        });

        let accept_task = tokio::spawn(start_server_loop(listener, Arc::clone(&shared)));

        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        *self.shared.active.borrow()
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.shared.limiter
    }
}

impl ServingEngine for HttpEngine {
    fn stop_accepting(&self) {
        self.shared.stop.send_replace(true);
    }

    async fn drained(&self) {
        let mut active = self.shared.active.subscribe();
        // The sender lives in `shared`, so this only returns once the count hits zero
        let _ = active.wait_for(|n| *n == 0).await;
    }

    fn force_close(&self) {
        self.shared.kill.send_replace(true);
        self.accept_task.abort();
    }
}
