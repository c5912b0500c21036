//! Zero-downtime restarts for a single-host HTTP server.
//!
//! A running generation hands its listening socket to the next one through
//! descriptor inheritance, then drains its own connections:
//!
//! 1. `SIGHUP` (or a config/binary change) enqueues a restart event
//! 2. The next generation is spawned with the listener in fd 3 and
//!    recovers it instead of binding
//! 3. Once it reports that it is accepting, the old generation stops
//!    accepting and drains in-flight connections for up to the grace period
//! 4. The old generation exits
//!
//! `SIGTERM`/`SIGINT` skip the spawn and go straight to the drain.
//!
//! Unix only.

#[cfg(not(unix))]
compile_error!("handoff_server requires a Unix platform");

pub mod config;
pub mod error;
pub mod logger;
pub mod server;

pub use error::{Error, Result};
