//! Route table of the status API.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the status API router.
///
/// | Method | Path | Handler |
/// |--------|------|---------|
/// | GET | `/` | status page |
/// | GET | `/health` | latest heartbeat |
/// | GET | `/ws/events` | bus message stream |
/// | GET | `/api/executions` | all snapshots |
/// | POST | `/api/executions` | start an execution |
/// | GET | `/api/executions/{id}` | one snapshot |
/// | POST | `/api/executions/{id}/stop` | stop an execution |
///
/// Any origin may call the API; the run dashboard is served elsewhere.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/ws/events", get(ws::ws_events))
        .route(
            "/api/executions",
            get(handlers::list_executions).post(handlers::start_execution),
        )
        .route("/api/executions/{id}", get(handlers::get_execution))
        .route("/api/executions/{id}/stop", post(handlers::stop_execution))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
