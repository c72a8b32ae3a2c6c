//! Live bus message stream over `WebSocket`.
//!
//! `GET /ws/events` forwards every [`BusMessage`] the engine publishes as
//! one JSON text frame. `?execution_id=...` narrows the stream to one
//! execution; heartbeats carry no execution and are then left out.
//!
//! A client that falls behind skips the lagged messages and resumes from
//! the most recent one.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use daqflow_types::{BusMessage, ExecutionId};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::state::AppState;

/// Query parameters of the event stream.
#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    /// Only forward messages of this execution.
    pub execution_id: Option<ExecutionId>,
}

impl EventFilter {
    /// Whether `message` passes the filter.
    pub fn admits(&self, message: &BusMessage) -> bool {
        self.execution_id
            .as_ref()
            .is_none_or(|wanted| message.execution_id() == Some(wanted))
    }
}

/// Upgrade to a `WebSocket` and stream bus messages.
///
/// The subscription is taken before the upgrade completes, so nothing
/// published after the request arrives is missed.
pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(filter): Query<EventFilter>,
) -> impl IntoResponse {
    let rx = state.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx, filter))
}

async fn stream_events(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<BusMessage>,
    filter: EventFilter,
) {
    debug!(execution_id = ?filter.execution_id, "Event stream client connected");

    let reason = loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) if filter.admits(&message) => match serde_json::to_string(&message) {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break "send failed";
                        }
                    }
                    Err(e) => {
                        warn!(msg_type = message.msg_type(), error = %e, "Dropping unencodable bus message");
                    }
                },
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event stream client lagged, skipping ahead");
                }
                Err(RecvError::Closed) => break "event channel closed",
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break "pong failed";
                    }
                }
                Some(Ok(Message::Close(_))) | None => break "client closed",
                Some(Err(e)) => {
                    debug!(error = %e, "Event stream socket error");
                    break "socket error";
                }
                Some(Ok(_)) => {}
            },
        }
    };

    debug!(reason, "Event stream client disconnected");
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use daqflow_types::{ExecutionStatus, Heartbeat, LivenessStatus, RunNumber, StatusReport};

    use super::*;

    fn report(id: &str) -> BusMessage {
        BusMessage::WorkflowCompleted(StatusReport {
            execution_id: ExecutionId::from(id),
            run_id: RunNumber(1),
            namespace: None,
            status: ExecutionStatus::Completed,
            units_emitted: 3,
            reason: None,
            timestamp: Utc::now(),
        })
    }

    fn heartbeat() -> BusMessage {
        BusMessage::Heartbeat(Heartbeat {
            agent_name: "daqflow-engine".to_owned(),
            namespace: None,
            status: LivenessStatus::Ok,
            listener_alive: true,
            running_executions: 0,
            sequence: 1,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn empty_filter_admits_everything() {
        let filter = EventFilter::default();
        assert!(filter.admits(&report("stf_datataking-alice-0001")));
        assert!(filter.admits(&heartbeat()));
    }

    #[test]
    fn execution_filter_admits_only_that_execution() {
        let filter = EventFilter {
            execution_id: Some(ExecutionId::from("stf_datataking-alice-0001")),
        };
        assert!(filter.admits(&report("stf_datataking-alice-0001")));
        assert!(!filter.admits(&report("stf_datataking-alice-0002")));
        assert!(!filter.admits(&heartbeat()));
    }
}
