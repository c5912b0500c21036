// Server module entry point
// Listener ownership, generation handoff, admission and the lifecycle state machine

pub mod connection;
pub mod engine;
pub mod generation;
pub mod handler;
pub mod lifecycle;
pub mod limiter;
pub mod listener;
pub mod signal;
pub mod spawner;
pub mod tls;
pub mod upgrade;

// Rust 不允许 loop 作为模块名（关键字），改用 server_loop
#[path = "loop.rs"]
pub mod server_loop;

// 重新导出常用类型
pub use engine::HttpEngine;
pub use generation::Generation;
pub use handler::Handler;
pub use lifecycle::{LifecycleController, LifecycleState, Outcome, ServingEngine};
pub use limiter::{AdmissionLimiter, AdmissionToken};
pub use listener::{acquire, ListenerHandle, TlsPaths, LISTEN_FD};
pub use signal::{start_signal_handler, SignalEvent};
pub use spawner::{notify_parent_ready, recover_requested, Handoff, ProcessSpawner, READY_FD};
pub use upgrade::BinaryWatcher;
