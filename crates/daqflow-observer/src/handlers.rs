//! REST API endpoint handlers for the status server.
//!
//! Every command and query goes through the same [`ControlDispatcher`]
//! the bus listener uses, so HTTP and bus clients see identical
//! behaviour.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Minimal HTML status page |
//! | `GET` | `/health` | Latest heartbeat (503 before the first beat) |
//! | `GET` | `/api/executions` | All known executions |
//! | `GET` | `/api/executions/{id}` | One execution snapshot |
//! | `POST` | `/api/executions` | Start an execution |
//! | `POST` | `/api/executions/{id}/stop` | Stop an execution |
//!
//! [`ControlDispatcher`]: daqflow_core::control::ControlDispatcher

// Axum handlers are async even when they never await.
#![allow(clippy::unused_async)]

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use daqflow_types::{
    ControlRequest, ControlResponse, ExecutionId, ExecutionSnapshot, ExecutionStatus,
    LivenessStatus, RunWorkflowRequest, StatusQuery, StopWorkflowRequest,
};
use tracing::warn;

use crate::error::ObserverError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET / -- minimal HTML status page
// ---------------------------------------------------------------------------

/// Serve a minimal HTML page showing engine status and API links.
pub async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let executions = state.supervisor().status_all();
    let running = executions
        .iter()
        .filter(|s| s.status == ExecutionStatus::Running)
        .count();
    let finished = executions.len().saturating_sub(running);
    let heartbeat = state.liveness.latest();
    let (liveness, beats) = match &heartbeat {
        Some(hb) if hb.status == LivenessStatus::Ok => ("OK", hb.sequence),
        Some(hb) => ("WARNING", hb.sequence),
        None => ("STARTING", 0),
    };
    let agent = heartbeat
        .as_ref()
        .map_or_else(|| "daqflow-engine".to_owned(), |hb| hb.agent_name.clone());
    let (listener, listener_class) = if state.liveness.listener_alive() {
        ("listening", "")
    } else {
        ("down", "warn")
    };
    let liveness_class = if liveness == "OK" { "" } else { "warn" };

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>DAQflow Engine</title>
    <style>
        body {{ font-family: monospace; margin: 2rem auto; max-width: 720px; }}
        table {{ border-collapse: collapse; }}
        td {{ border: 1px solid #999; padding: 0.4rem 1rem; }}
        .warn {{ color: #b35900; }}
    </style>
</head>
<body>
    <h1>{agent}</h1>
    <p>DAQ workflow execution engine</p>

    <table>
        <tr><td>Liveness</td><td class="{liveness_class}">{liveness}</td></tr>
        <tr><td>Heartbeats</td><td>{beats}</td></tr>
        <tr><td>Control listener</td><td class="{listener_class}">{listener}</td></tr>
        <tr><td>Running executions</td><td>{running}</td></tr>
        <tr><td>Finished executions</td><td>{finished}</td></tr>
    </table>

    <h2>API</h2>
    <ul>
        <li>GET <a href="/health">/health</a> -- Latest heartbeat</li>
        <li>GET <a href="/api/executions">/api/executions</a> -- All executions</li>
        <li>GET /api/executions/{{id}} -- One execution</li>
        <li>POST /api/executions -- Start a workflow</li>
        <li>POST /api/executions/{{id}}/stop -- Stop a workflow</li>
    </ul>

    <p>Live bus messages: <code>ws://host:port/ws/events[?execution_id=ID]</code></p>
</body>
</html>"#
    ))
}

// ---------------------------------------------------------------------------
// GET /health -- latest heartbeat
// ---------------------------------------------------------------------------

/// Return the latest heartbeat.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ObserverError> {
    let heartbeat = state
        .liveness
        .latest()
        .ok_or(ObserverError::NoHeartbeat)?;
    Ok(Json(heartbeat))
}

// ---------------------------------------------------------------------------
// GET /api/executions -- list executions
// ---------------------------------------------------------------------------

/// List every known execution, live and finished.
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ObserverError> {
    let response = state
        .dispatcher
        .dispatch(ControlRequest::StatusRequest(StatusQuery::default()));
    match response {
        ControlResponse::StatusResponse { executions } => Ok(Json(serde_json::json!({
            "count": executions.len(),
            "executions": executions,
        }))),
        other => Err(unexpected(&other)),
    }
}

// ---------------------------------------------------------------------------
// GET /api/executions/{id} -- one execution
// ---------------------------------------------------------------------------

/// Return the snapshot of one execution.
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionSnapshot>, ObserverError> {
    let execution_id = ExecutionId::from(id);
    let response = state
        .dispatcher
        .dispatch(ControlRequest::StatusRequest(StatusQuery {
            namespace: None,
            execution_id: Some(execution_id.clone()),
        }));
    match response {
        ControlResponse::StatusResponse { executions } => executions
            .into_iter()
            .next()
            .map(Json)
            .ok_or(ObserverError::ExecutionNotFound { execution_id }),
        ControlResponse::NotFound { execution_id } => {
            Err(ObserverError::ExecutionNotFound { execution_id })
        }
        other => Err(unexpected(&other)),
    }
}

// ---------------------------------------------------------------------------
// POST /api/executions -- start
// ---------------------------------------------------------------------------

/// Start an execution. The body carries the `run_workflow` fields.
///
/// A body that is not a valid request is answered with `rejected`, the
/// same as a malformed message on the control destination.
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RunWorkflowRequest>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(request)) => {
            control_response(state.dispatcher.dispatch(ControlRequest::RunWorkflow(request)))
        }
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Rejecting malformed start request");
            control_response(ControlResponse::Rejected {
                reason: rejection.body_text(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// POST /api/executions/{id}/stop -- stop
// ---------------------------------------------------------------------------

/// Signal an execution to stop at its next checkpoint.
pub async fn stop_execution(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    control_response(state.dispatcher.dispatch(ControlRequest::StopWorkflow(
        StopWorkflowRequest {
            namespace: None,
            execution_id: ExecutionId::from(id),
        },
    )))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// HTTP status for a control response.
pub const fn status_for(response: &ControlResponse) -> StatusCode {
    match response {
        ControlResponse::WorkflowStarted { .. } => StatusCode::CREATED,
        ControlResponse::StopAccepted { .. } => StatusCode::ACCEPTED,
        ControlResponse::StatusResponse { .. } => StatusCode::OK,
        ControlResponse::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ControlResponse::NotFound { .. } => StatusCode::NOT_FOUND,
        ControlResponse::AlreadyFinished { .. } => StatusCode::CONFLICT,
        ControlResponse::Rejected { .. } => StatusCode::BAD_REQUEST,
    }
}

fn control_response(response: ControlResponse) -> Response {
    (status_for(&response), Json(response)).into_response()
}

const fn unexpected(response: &ControlResponse) -> ObserverError {
    ObserverError::UnexpectedResponse {
        msg_type: response.msg_type(),
    }
}
