#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use handoff_server::server::{
    acquire, handler, AdmissionLimiter, Handler, HttpEngine, ListenerHandle,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Fresh listener on an ephemeral loopback port.
pub fn bind() -> ListenerHandle {
    acquire("127.0.0.1:0".parse().unwrap(), false, None).unwrap()
}

/// Header read timeout used unless a test needs a different one
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Start a serving engine on a duplicate of `listener`.
pub fn start(listener: &ListenerHandle, capacity: usize, handler: Handler) -> HttpEngine {
    start_with_header_timeout(listener, capacity, handler, HEADER_READ_TIMEOUT)
}

pub fn start_with_header_timeout(
    listener: &ListenerHandle,
    capacity: usize,
    handler: Handler,
    header_read_timeout: Duration,
) -> HttpEngine {
    HttpEngine::start(
        listener.tokio_listener().unwrap(),
        Arc::new(AdmissionLimiter::new(capacity)),
        handler,
        None,
        header_read_timeout,
    )
    .unwrap()
}

/// Responds with `label` immediately.
pub fn labeled(label: &'static str) -> Handler {
    handler::from_fn(move |_req| async move { handler::text(label) })
}

/// Counts the request in `started`, then responds with `label` after `delay`.
pub fn delayed(label: &'static str, delay: Duration, started: Arc<AtomicUsize>) -> Handler {
    handler::from_fn(move |_req| {
        started.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(delay).await;
            handler::text(label)
        }
    })
}

/// One-shot HTTP/1.1 GET. Returns the status code and body.
pub async fn get(addr: SocketAddr, path: &str) -> io::Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let text = String::from_utf8_lossy(&raw);

    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "incomplete response");
    let (head, body) = text.split_once("\r\n\r\n").ok_or_else(invalid)?;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(invalid)?;
    Ok((status, body.to_string()))
}

/// Poll `condition` every few milliseconds for up to five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
