//! Lifecycle controller.
//!
//! # State machine
//! ```text
//! Serving --Shutdown--> Draining --drained or grace elapsed--> Terminated
//! Serving --Restart---> HandoffPending --spawned and ready--> Draining
//!                                      --spawn failed-------> Serving
//! ```
//!
//! Every transition runs on the single task that owns the controller and
//! consumes the event queue, so no two transitions ever race. Once the
//! controller leaves `Serving` for good it drops the queue: later signals
//! are not acted on.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::listener::ListenerHandle;
use super::signal::SignalEvent;
use super::spawner::Handoff;
use crate::logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Serving,
    HandoffPending,
    Draining,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Serving => "serving",
            Self::HandoffPending => "handoff-pending",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// The serving engine as seen by the controller.
pub trait ServingEngine: Send + Sync {
    /// Stop accepting new connections and let in-flight ones finish.
    fn stop_accepting(&self);

    /// Resolves once no connection is in flight.
    fn drained(&self) -> impl Future<Output = ()> + Send;

    /// Abort every remaining connection.
    fn force_close(&self);
}

impl<T: ServingEngine> ServingEngine for Arc<T> {
    fn stop_accepting(&self) {
        (**self).stop_accepting();
    }

    fn drained(&self) -> impl Future<Output = ()> + Send {
        (**self).drained()
    }

    fn force_close(&self) {
        (**self).force_close();
    }
}

/// How the generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Pid of the generation that took over the listener, if any
    pub successor: Option<u32>,
    /// Remaining connections were force-closed after the grace period
    pub drain_timed_out: bool,
}

pub struct LifecycleController<E, H> {
    listener: Option<ListenerHandle>,
    engine: E,
    handoff: H,
    grace: Duration,
    state: watch::Sender<LifecycleState>,
}

impl<E, H> LifecycleController<E, H>
where
    E: ServingEngine,
    H: Handoff,
{
    /// Controller for a generation that is already serving on `listener`.
    pub fn new(listener: ListenerHandle, engine: E, handoff: H, grace: Duration) -> Self {
        Self {
            listener: Some(listener),
            engine,
            handoff,
            grace,
            state: watch::Sender::new(LifecycleState::Serving),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Observe state transitions from another task.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub const fn engine(&self) -> &E {
        &self.engine
    }

    fn transition(&self, to: LifecycleState) {
        let from = self.state.send_replace(to);
        if from != to {
            logger::log_transition(from, to);
        }
    }

    /// Consume lifecycle events until this generation terminates.
    ///
    /// A closed event queue is treated as a shutdown request.
    pub async fn run(mut self, mut events: mpsc::Receiver<SignalEvent>) -> Outcome {
        let successor = loop {
            match events.recv().await.unwrap_or(SignalEvent::Shutdown) {
                SignalEvent::Shutdown => break None,
                SignalEvent::Restart => {
                    if let Some(pid) = self.hand_off().await {
                        break Some(pid);
                    }
                }
            }
        };
        drop(events);

        if let Some(pid) = successor {
            logger::log_handoff_complete(pid);
            // The successor holds its own copy of the socket now
            self.listener = None;
        }

        let drain_timed_out = self.drain().await;
        self.transition(LifecycleState::Terminated);

        Outcome {
            successor,
            drain_timed_out,
        }
    }

    async fn hand_off(&self) -> Option<u32> {
        let listener = self.listener.as_ref()?;

        self.transition(LifecycleState::HandoffPending);
        match self.handoff.hand_off(listener).await {
            Ok(pid) => Some(pid),
            Err(e) => {
                logger::log_handoff_failed(&e);
                self.transition(LifecycleState::Serving);
                None
            }
        }
    }

    /// Returns whether the grace period ran out.
    async fn drain(&self) -> bool {
        self.transition(LifecycleState::Draining);
        self.engine.stop_accepting();
        logger::log_drain_started(self.grace);

        if tokio::time::timeout(self.grace, self.engine.drained())
            .await
            .is_ok()
        {
            tracing::info!("all connections drained");
            false
        } else {
            logger::log_drain_timeout(self.grace);
            self.engine.force_close();
            true
        }
    }
}
