//! Integration tests for the status API endpoints.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server. The runtime publishes into an in-memory
//! recorder tapped into the live event channel.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use daqflow_core::config::EngineConfig;
use daqflow_core::publisher::{ChannelPublisher, EventPublisher, FanoutPublisher, RecordingPublisher};
use daqflow_core::runtime::Runtime;
use daqflow_observer::router::build_router;
use daqflow_observer::spawn_observer;
use daqflow_observer::state::AppState;
use daqflow_types::{ExecutionId, ExecutionStatus};
use serde_json::{Value, json};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    runtime: Runtime,
    state: Arc<AppState>,
    recorder: Arc<RecordingPublisher>,
}

impl Harness {
    fn new() -> Self {
        let mut config = EngineConfig::parse(
            "workflows:\n  stf_datataking:\n    physics_period_count: 1\n    physics_period_duration: 10\n    stf_interval: 2\n",
        )
        .unwrap();
        config.engine.namespace = Some("testbed".to_owned());
        config.engine.operator = Some("tester".to_owned());
        config.engine.default_realtime = false;

        let recorder = Arc::new(RecordingPublisher::new());
        let events = ChannelPublisher::new();
        let publisher = FanoutPublisher::new(Arc::clone(&recorder) as Arc<dyn EventPublisher>)
            .with_tap(Arc::new(events.clone()));
        let runtime = Runtime::new(&config, Arc::new(publisher)).unwrap();
        let state = Arc::new(AppState::from_runtime(&runtime, events));
        Self {
            runtime,
            state,
            recorder,
        }
    }

    fn router(&self) -> Router {
        build_router(Arc::clone(&self.state))
    }
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(path: &str, body: &Value) -> Request<Body> {
    Request::post(path)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn start(router: &Router, body: &Value) -> ExecutionId {
    let response = router.clone().oneshot(post_json("/api/executions", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["msg_type"], "workflow_started");
    ExecutionId::from(json["execution_id"].as_str().unwrap())
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_index_returns_html() {
    let harness = Harness::new();

    let response = harness
        .router()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.contains("text/html"));
}

#[tokio::test]
async fn test_health_unavailable_before_first_beat() {
    let harness = Harness::new();

    let response = harness
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], 503);
}

#[tokio::test]
async fn test_health_reports_latest_beat() {
    let harness = Harness::new();
    let liveness = harness.runtime.spawn_liveness(Vec::new());
    for _ in 0..1_000 {
        if harness.state.liveness.latest().is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }

    let response = harness
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["agent_name"], "daqflow-engine");
    assert_eq!(json["sequence"], 1);
    // No control listener was spawned.
    assert_eq!(json["status"], "WARNING");

    assert!(harness.runtime.shutdown().await);
    liveness.await.unwrap();
}

#[tokio::test]
async fn test_start_and_get_execution() {
    let harness = Harness::new();
    let router = harness.router();

    let id = start(&router, &json!({})).await;
    let snapshot = harness.state.supervisor().wait_finished(&id, WAIT).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);

    let response = router
        .clone()
        .oneshot(
            Request::get(format!("/api/executions/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "completed");
    assert_eq!(json["units_emitted"], 5);
    assert_eq!(json["phase"], "ended");

    let response = router
        .oneshot(Request::get("/api/executions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["executions"][0]["execution_id"], id.as_str());

    assert_eq!(
        harness
            .recorder
            .messages()
            .iter()
            .filter(|m| m.msg_type() == "stf_gen")
            .count(),
        5
    );
}

#[tokio::test]
async fn test_start_with_invalid_params_is_unprocessable() {
    let harness = Harness::new();

    let response = harness
        .router()
        .oneshot(post_json(
            "/api/executions",
            &json!({"params": {"stf_interval": -1}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["msg_type"], "validation_error");
    assert!(harness.state.supervisor().status_all().is_empty());
}

#[tokio::test]
async fn test_start_for_other_namespace_is_rejected() {
    let harness = Harness::new();

    let response = harness
        .router()
        .oneshot(post_json("/api/executions", &json!({"namespace": "elsewhere"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["msg_type"], "rejected");
}

#[tokio::test]
async fn test_start_with_malformed_body_is_rejected() {
    let harness = Harness::new();

    let response = harness
        .router()
        .oneshot(
            Request::post("/api/executions")
                .header("content-type", "application/json")
                .body(Body::from("{\"workflow_name\": "))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["msg_type"], "rejected");
    assert!(!json["reason"].as_str().unwrap().is_empty());
    assert!(harness.state.supervisor().status_all().is_empty());
}

#[tokio::test]
async fn test_start_with_wrong_field_type_is_rejected() {
    let harness = Harness::new();

    let response = harness
        .router()
        .oneshot(post_json("/api/executions", &json!({"params": "stf_count=3"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["msg_type"], "rejected");
}

#[tokio::test]
async fn test_get_unknown_execution_returns_404() {
    let harness = Harness::new();

    let response = harness
        .router()
        .oneshot(
            Request::get("/api/executions/stf_datataking-nobody-0001")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_lifecycle() {
    let harness = Harness::new();
    let router = harness.router();

    let response = router
        .clone()
        .oneshot(
            Request::post("/api/executions/stf_datataking-nobody-0001/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let id = start(
        &router,
        &json!({"realtime": true, "params": {"physics_period_duration": 3600}}),
    )
    .await;
    let stop_path = format!("/api/executions/{id}/stop");

    let response = router
        .clone()
        .oneshot(Request::post(&stop_path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["msg_type"], "stop_accepted");
    assert_eq!(json["already_requested"], false);

    let snapshot = harness.state.supervisor().wait_finished(&id, WAIT).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Stopped);

    let response = router
        .oneshot(Request::post(&stop_path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "stopped");
}

#[tokio::test]
async fn test_event_channel_sees_emitted_messages() {
    let harness = Harness::new();
    let mut rx = harness.state.subscribe();

    let id = start(&harness.router(), &json!({"params": {"stf_count": 1}})).await;

    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.msg_type(), "run_imminent");
    assert_eq!(first.execution_id(), Some(&id));
}

#[tokio::test]
async fn test_nonexistent_route_returns_404() {
    let harness = Harness::new();

    let response = harness
        .router()
        .oneshot(
            Request::get("/api/nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_spawned_observer_stops_on_cancel() {
    let harness = Harness::new();
    let shutdown = harness.runtime.cancellation().child_token();

    let observer = spawn_observer(0, Arc::clone(&harness.state), shutdown.clone())
        .await
        .unwrap();
    assert_ne!(observer.local_addr.port(), 0);

    shutdown.cancel();
    tokio::time::timeout(WAIT, observer.task).await.unwrap().unwrap();
}
