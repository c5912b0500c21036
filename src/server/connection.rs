// Connection handling module
// Admission check, optional TLS handshake and the HTTP/1.1 service for one connection

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::engine::{ConnectionGuard, EngineShared};
use super::limiter::AdmissionToken;
use crate::logger;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a drained connection may take to send its first request
const FIRST_REQUEST_GRACE: Duration = Duration::from_millis(500);

/// Admit a freshly accepted connection and spawn its task.
///
/// The admission check and the in-flight count both happen here, before the
/// task is spawned, so a drain started right after this call still waits
/// for the connection.
pub fn accept_connection(stream: TcpStream, peer_addr: SocketAddr, shared: &Arc<EngineShared>) {
    let Some(token) = shared.limiter.try_acquire_token() else {
        logger::log_admission_rejected(&peer_addr, shared.limiter.capacity());
        drop(stream);
        return;
    };

    configure_stream(&stream, &peer_addr);
    let guard = shared.track();
    tracing::trace!(peer = %peer_addr, "connection accepted");

    tokio::spawn(handle_connection(
        stream,
        peer_addr,
        Arc::clone(shared),
        token,
        guard,
    ));
}

/// Disable Nagle on an accepted stream. A failure is logged and the
/// connection is still served.
fn configure_stream(stream: &TcpStream, peer_addr: &SocketAddr) -> bool {
    match stream.set_nodelay(true) {
        Ok(()) => true,
        Err(e) => {
            logger::log_connection_error(peer_addr, &e);
            false
        }
    }
}

/// Serve one connection, holding its admission token and in-flight guard
/// for the whole lifetime of the task.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<EngineShared>,
    _token: AdmissionToken,
    _guard: ConnectionGuard,
) {
    match shared.tls.clone() {
        Some(acceptor) => {
            let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream));
            match handshake.await {
                Ok(Ok(tls_stream)) => serve(tls_stream, peer_addr, &shared).await,
                Ok(Err(e)) => logger::log_connection_error(&peer_addr, &e),
                Err(_) => tracing::debug!(peer = %peer_addr, "TLS handshake timed out"),
            }
        }
        None => serve(stream, peer_addr, &shared).await,
    }
}

/// Run the HTTP/1.1 connection until it completes, is gracefully shut down
/// by a drain, or is killed after the drain grace period.
async fn serve<I>(io: I, peer_addr: SocketAddr, shared: &Arc<EngineShared>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = Arc::clone(&shared.handler);
    let (started_tx, mut started) = watch::channel(false);
    let service = service_fn(move |req| {
        started_tx.send_replace(true);
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler(req).await) }
    });

    let mut builder = http1::Builder::new();
    builder
        .keep_alive(true)
        .timer(TokioTimer::new())
        .header_read_timeout(shared.header_read_timeout);
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut stop = shared.stop.subscribe();
    let mut kill = shared.kill.subscribe();

    // hyper closes a connection that has not read a request yet as soon as it
    // is shut down, so a client that connected just before the drain would
    // see its request dropped. Such connections get a short window first.
    let first_request = tokio::time::sleep(FIRST_REQUEST_GRACE);
    tokio::pin!(first_request);

    let mut draining = *stop.borrow_and_update();
    let mut shutdown_pending = draining;
    let mut kill_open = true;

    loop {
        if shutdown_pending && *started.borrow_and_update() {
            shutdown_pending = false;
            conn.as_mut().graceful_shutdown();
        }

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    logger::log_connection_error(&peer_addr, &e);
                }
                break;
            }

            changed = stop.changed(), if !draining => {
                draining = true;
                if changed.is_ok() {
                    shutdown_pending = true;
                    first_request
                        .as_mut()
                        .reset(tokio::time::Instant::now() + FIRST_REQUEST_GRACE);
                }
            }

            _ = started.changed(), if shutdown_pending => {
                shutdown_pending = false;
                conn.as_mut().graceful_shutdown();
            }

            () = &mut first_request, if shutdown_pending => {
                shutdown_pending = false;
                conn.as_mut().graceful_shutdown();
            }

            changed = kill.changed(), if kill_open => {
                if changed.is_err() {
                    kill_open = false;
                } else if *kill.borrow() {
                    tracing::debug!(peer = %peer_addr, "connection force-closed after drain timeout");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn accepted_streams_disable_nagle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (stream, peer) = accepted.unwrap();
        let _client = connected.unwrap();

        assert!(!stream.nodelay().unwrap());
        assert!(configure_stream(&stream, &peer));
        assert!(stream.nodelay().unwrap());
    }
}
