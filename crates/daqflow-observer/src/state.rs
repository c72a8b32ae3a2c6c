//! Shared application state for the status API server.
//!
//! [`AppState`] holds the control dispatcher (shared with the bus
//! listener), the liveness state written by the engine's heartbeat loop,
//! and the in-process channel every emitted bus message is tapped into.
//! Reads never wait on a running execution.

use std::sync::Arc;

use daqflow_core::control::ControlDispatcher;
use daqflow_core::publisher::ChannelPublisher;
use daqflow_core::runtime::{LivenessState, Runtime};
use daqflow_core::supervisor::ExecutionSupervisor;
use daqflow_types::BusMessage;
use tokio::sync::broadcast;

/// Shared state for the Axum application.
///
/// Wrapped in [`Arc`] and injected via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Dispatcher used for every command and status query.
    pub dispatcher: Arc<ControlDispatcher>,
    /// Latest heartbeat and listener health.
    pub liveness: Arc<LivenessState>,
    /// Live stream of emitted bus messages.
    pub events: ChannelPublisher,
}

impl AppState {
    /// Create the state from its parts.
    pub const fn new(
        dispatcher: Arc<ControlDispatcher>,
        liveness: Arc<LivenessState>,
        events: ChannelPublisher,
    ) -> Self {
        Self {
            dispatcher,
            liveness,
            events,
        }
    }

    /// Create the state for a runtime whose publisher taps into `events`.
    pub fn from_runtime(runtime: &Runtime, events: ChannelPublisher) -> Self {
        Self::new(runtime.dispatcher(), runtime.liveness(), events)
    }

    /// The execution supervisor behind the dispatcher.
    pub fn supervisor(&self) -> &ExecutionSupervisor {
        self.dispatcher.supervisor()
    }

    /// Subscribe to the live message stream.
    ///
    /// Returns a receiver that yields every [`BusMessage`] published
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.events.subscribe()
    }
}
