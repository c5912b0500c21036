// Server loop module
// Accepts connections until the engine is told to stop

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use super::connection::accept_connection;
use super::engine::EngineShared;
use crate::logger;

/// Pause after an accept error so descriptor exhaustion doesn't spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accept loop for one generation.
///
/// Runs until the stop flag is raised, then drops its duplicate of the
/// listening descriptor. Connections still queued on the socket stay there
/// for whichever generation keeps accepting.
pub async fn start_server_loop(listener: TcpListener, shared: Arc<EngineShared>) {
    let mut stop = shared.stop.subscribe();
    if *stop.borrow_and_update() {
        return;
    }

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => accept_connection(stream, peer_addr, &shared),
                    Err(e) => {
                        logger::log_accept_error(&e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    tracing::info!(
        addr = ?listener.local_addr().ok(),
        "accept loop stopped, listener released by this generation"
    );
}
