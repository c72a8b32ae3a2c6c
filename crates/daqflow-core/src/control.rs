//! Control request dispatch and the control channel listener.
//!
//! [`ControlDispatcher`] turns a [`ControlRequest`] into a
//! [`ControlResponse`] by handing off to the [`ExecutionSupervisor`]. It
//! never waits on an execution: `run_workflow` returns as soon as the
//! execution task is spawned.
//!
//! [`run_listener`] drives a stream of inbound messages through the
//! dispatcher. Replies are sent from their own tasks so a slow transport
//! never holds up the next receive.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use daqflow_types::{
    ControlRequest, ControlResponse, ExecutionId, RunWorkflowRequest, StatusQuery, StopWorkflowRequest,
};
use futures::{Stream, StreamExt as _};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::params::{self, ParameterError, ParameterSet};
use crate::publisher::PublishError;
use crate::supervisor::{CancelOutcome, ExecutionSupervisor, StartRequest, SupervisorError};

/// Errors that make a control message unprocessable.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The payload is not a valid control request.
    #[error("malformed control request: {source}")]
    Malformed {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// The request is addressed to another testbed.
    #[error("namespace mismatch: engine serves `{expected}`, request is for `{requested}`")]
    NamespaceMismatch {
        /// The engine's namespace.
        expected: String,
        /// The namespace named by the request.
        requested: String,
    },
}

/// Routes control requests to the execution supervisor.
pub struct ControlDispatcher {
    supervisor: ExecutionSupervisor,
    namespace: Option<String>,
    profiles: BTreeMap<String, Map<String, Value>>,
    default_realtime: bool,
    default_operator: String,
}

impl ControlDispatcher {
    /// Create a dispatcher using the profiles and defaults in `config`.
    pub fn new(supervisor: ExecutionSupervisor, config: &EngineConfig) -> Self {
        Self {
            supervisor,
            namespace: config.engine.namespace.clone(),
            profiles: config.workflows.clone(),
            default_realtime: config.engine.default_realtime,
            default_operator: config.default_operator(),
        }
    }

    /// The supervisor requests are dispatched to.
    pub const fn supervisor(&self) -> &ExecutionSupervisor {
        &self.supervisor
    }

    /// Decode and dispatch a raw JSON payload.
    pub fn handle_bytes(&self, payload: &[u8]) -> ControlResponse {
        match serde_json::from_slice::<ControlRequest>(payload) {
            Ok(request) => self.dispatch(request),
            Err(e) => {
                let error = ControlError::from(e);
                warn!(error = %error, "Discarding malformed control message");
                ControlResponse::Rejected {
                    reason: error.to_string(),
                }
            }
        }
    }

    /// Dispatch one request. Never blocks on an execution.
    pub fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        if let Err(e) = self.check_namespace(request.namespace()) {
            warn!(msg_type = request.msg_type(), error = %e, "Rejecting control request");
            return ControlResponse::Rejected {
                reason: e.to_string(),
            };
        }
        debug!(msg_type = request.msg_type(), "Dispatching control request");
        match request {
            ControlRequest::RunWorkflow(run) => self.run_workflow(&run),
            ControlRequest::StopWorkflow(stop) => self.stop_workflow(stop),
            ControlRequest::StatusRequest(query) => self.status_request(query),
        }
    }

    fn check_namespace(&self, requested: Option<&str>) -> Result<(), ControlError> {
        match (self.namespace.as_deref(), requested) {
            (Some(expected), Some(requested)) if expected != requested => {
                Err(ControlError::NamespaceMismatch {
                    expected: expected.to_owned(),
                    requested: requested.to_owned(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Merge the request's profile and overrides into a parameter set.
    ///
    /// # Errors
    ///
    /// Returns a [`ParameterError`] if the workflow name, profile or
    /// merged parameters are invalid.
    pub fn resolve_parameters(
        &self,
        request: &RunWorkflowRequest,
    ) -> Result<ParameterSet, ParameterError> {
        params::validate_workflow_name(&request.workflow_name)?;
        let profile = match request.config.as_deref() {
            Some(name) => Some(self.profiles.get(name).ok_or_else(|| {
                ParameterError::UnknownProfile {
                    name: name.to_owned(),
                }
            })?),
            None => self.profiles.get(&request.workflow_name),
        };
        let resolved = ParameterSet::from_map(params::layer(profile, &request.params))?;
        if resolved.unit_count.is_some() && resolved.max_duration.is_some() {
            warn!(
                workflow = %request.workflow_name,
                "Both stf_count and max_duration given; stf_count governs"
            );
        }
        Ok(resolved)
    }

    fn run_workflow(&self, request: &RunWorkflowRequest) -> ControlResponse {
        let params = match self.resolve_parameters(request) {
            Ok(params) => params,
            Err(e) => {
                info!(workflow = %request.workflow_name, error = %e, "Run request failed validation");
                return ControlResponse::ValidationError {
                    reason: e.to_string(),
                };
            }
        };
        let start = StartRequest {
            workflow_name: request.workflow_name.clone(),
            operator: request
                .executed_by
                .clone()
                .unwrap_or_else(|| self.default_operator.clone()),
            params,
            realtime: request.realtime.unwrap_or(self.default_realtime),
        };
        match self.supervisor.start(start) {
            Ok(started) => ControlResponse::WorkflowStarted {
                execution_id: started.execution_id,
                run_id: started.run_id,
            },
            Err(e) => ControlResponse::Rejected {
                reason: e.to_string(),
            },
        }
    }

    fn stop_workflow(&self, request: StopWorkflowRequest) -> ControlResponse {
        let result = self.supervisor.cancel(&request.execution_id);
        into_stop_response(request.execution_id, result)
    }

    fn status_request(&self, query: StatusQuery) -> ControlResponse {
        match query.execution_id {
            Some(id) => match self.supervisor.status(&id) {
                Ok(snapshot) => ControlResponse::StatusResponse {
                    executions: vec![snapshot],
                },
                Err(e) => into_error_response(e),
            },
            None => ControlResponse::StatusResponse {
                executions: self.supervisor.status_all(),
            },
        }
    }
}

fn into_stop_response(
    execution_id: ExecutionId,
    result: Result<CancelOutcome, SupervisorError>,
) -> ControlResponse {
    match result {
        Ok(outcome) => ControlResponse::StopAccepted {
            execution_id,
            already_requested: outcome == CancelOutcome::AlreadySignalled,
        },
        Err(e) => into_error_response(e),
    }
}

fn into_error_response(error: SupervisorError) -> ControlResponse {
    match error {
        SupervisorError::NotFound { execution_id } => ControlResponse::NotFound { execution_id },
        SupervisorError::AlreadyFinished {
            execution_id,
            status,
        } => ControlResponse::AlreadyFinished {
            execution_id,
            status,
        },
        SupervisorError::ShuttingDown => ControlResponse::Rejected {
            reason: SupervisorError::ShuttingDown.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Where to send the response to one inbound message.
#[async_trait]
pub trait ReplyHandle: Send {
    /// Deliver the response. Consumes the handle.
    async fn reply(self: Box<Self>, response: &ControlResponse) -> Result<(), PublishError>;
}

/// One message received on the control channel.
pub struct InboundControl {
    /// Raw JSON payload.
    pub payload: Vec<u8>,
    /// Reply address, when the transport provides one.
    pub reply: Option<Box<dyn ReplyHandle>>,
}

/// Why the listener returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The cancellation token fired.
    Shutdown,
    /// The inbound stream closed.
    StreamEnded,
}

/// Receive and dispatch control messages until cancelled or the stream ends.
pub async fn run_listener<S>(
    dispatcher: Arc<ControlDispatcher>,
    mut inbound: S,
    cancel: CancellationToken,
) -> ListenerExit
where
    S: Stream<Item = InboundControl> + Unpin + Send,
{
    info!("Control listener started");
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("Control listener shutting down");
                return ListenerExit::Shutdown;
            }
            message = inbound.next() => message,
        };
        let Some(message) = message else {
            return ListenerExit::StreamEnded;
        };

        let response = dispatcher.handle_bytes(&message.payload);
        debug!(msg_type = response.msg_type(), "Control request handled");

        if let Some(reply) = message.reply {
            tokio::spawn(async move {
                if let Err(e) = reply.reply(&response).await {
                    warn!(error = %e, msg_type = response.msg_type(), "Failed to send control reply");
                }
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use daqflow_types::ExecutionStatus;
    use futures::channel::mpsc;
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::publisher::{EventPublisher, RecordingPublisher};

    const WAIT: Duration = Duration::from_secs(10);

    fn config(yaml: &str) -> EngineConfig {
        let mut config = EngineConfig::parse(yaml).unwrap();
        config.engine.namespace = Some("testbed".to_owned());
        config.engine.operator = Some("tester".to_owned());
        config.engine.default_realtime = false;
        config.transport.retry_backoff_ms = 1;
        config
    }

    fn dispatcher_with(config: &EngineConfig) -> (ControlDispatcher, Arc<RecordingPublisher>) {
        let recorder = Arc::new(RecordingPublisher::new());
        let supervisor = ExecutionSupervisor::new(
            config.supervisor_settings().unwrap(),
            Arc::clone(&recorder) as Arc<dyn EventPublisher>,
            CancellationToken::new(),
        );
        (ControlDispatcher::new(supervisor, config), recorder)
    }

    fn dispatcher() -> (ControlDispatcher, Arc<RecordingPublisher>) {
        dispatcher_with(&config(
            "workflows:\n  stf_datataking:\n    physics_period_count: 1\n    physics_period_duration: 10\n    stf_interval: 2\n",
        ))
    }

    fn request(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn started_id(response: &ControlResponse) -> ExecutionId {
        match response {
            ControlResponse::WorkflowStarted { execution_id, .. } => execution_id.clone(),
            other => panic!("expected workflow_started, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_uses_profile_named_after_workflow() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher.handle_bytes(&request(json!({"msg_type": "run_workflow"})));
        let id = started_id(&response);
        assert_eq!(id.as_str(), "stf_datataking-tester-0001");

        let snapshot = dispatcher.supervisor().wait_finished(&id, WAIT).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.units_emitted, 5);
    }

    #[tokio::test]
    async fn overrides_layer_on_top_of_profile() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher.handle_bytes(&request(json!({
            "msg_type": "run_workflow",
            "params": {"stf_count": 3},
            "executed_by": "shifter",
        })));
        let id = started_id(&response);
        assert!(id.as_str().contains("shifter"));

        let snapshot = dispatcher.supervisor().wait_finished(&id, WAIT).await.unwrap();
        assert_eq!(snapshot.units_emitted, 3);
    }

    #[tokio::test]
    async fn invalid_parameters_are_reported_not_started() {
        let (dispatcher, recorder) = dispatcher();
        let response = dispatcher.handle_bytes(&request(json!({
            "msg_type": "run_workflow",
            "params": {"stf_interval": 0},
        })));
        assert!(matches!(response, ControlResponse::ValidationError { .. }));

        let unknown_profile = dispatcher.handle_bytes(&request(json!({
            "msg_type": "run_workflow",
            "config": "no_such_profile",
        })));
        match unknown_profile {
            ControlResponse::ValidationError { reason } => assert!(reason.contains("no_such_profile")),
            other => panic!("expected validation_error, got {other:?}"),
        }

        let bad_name = dispatcher.handle_bytes(&request(json!({
            "msg_type": "run_workflow",
            "workflow_name": "Bad Name",
        })));
        assert!(matches!(bad_name, ControlResponse::ValidationError { .. }));

        assert_eq!(dispatcher.supervisor().running_count(), 0);
        assert!(dispatcher.supervisor().status_all().is_empty());
        assert_eq!(recorder.attempts(), 0);
    }

    #[tokio::test]
    async fn missing_profile_and_params_is_a_validation_error() {
        let (dispatcher, _) = dispatcher_with(&config(""));
        let response = dispatcher.handle_bytes(&request(json!({"msg_type": "run_workflow"})));
        assert!(matches!(response, ControlResponse::ValidationError { .. }));
    }

    #[tokio::test]
    async fn status_of_unknown_execution_is_not_found() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher.handle_bytes(&request(json!({
            "msg_type": "status_request",
            "execution_id": "stf_datataking-nobody-0042",
        })));
        assert_eq!(
            response,
            ControlResponse::NotFound {
                execution_id: ExecutionId::from("stf_datataking-nobody-0042"),
            }
        );

        let stop = dispatcher.handle_bytes(&request(json!({
            "msg_type": "stop_workflow",
            "execution_id": "stf_datataking-nobody-0042",
        })));
        assert!(matches!(stop, ControlResponse::NotFound { .. }));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_finished_runs_report_so() {
        let (dispatcher, _) = dispatcher();
        let run = dispatcher.handle_bytes(&request(json!({
            "msg_type": "run_workflow",
            "params": {"physics_period_count": 0, "allow_unbounded": true},
        })));
        let id = started_id(&run);
        let stop = request(json!({"msg_type": "stop_workflow", "execution_id": id}));

        let first = dispatcher.handle_bytes(&stop);
        assert_eq!(
            first,
            ControlResponse::StopAccepted {
                execution_id: id.clone(),
                already_requested: false,
            }
        );
        let second = dispatcher.handle_bytes(&stop);
        assert!(matches!(
            second,
            ControlResponse::StopAccepted {
                already_requested: true,
                ..
            } | ControlResponse::AlreadyFinished { .. }
        ));

        let snapshot = dispatcher.supervisor().wait_finished(&id, WAIT).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Stopped);
        assert_eq!(
            dispatcher.handle_bytes(&stop),
            ControlResponse::AlreadyFinished {
                execution_id: id,
                status: ExecutionStatus::Stopped,
            }
        );
    }

    #[tokio::test]
    async fn foreign_namespace_and_garbage_are_rejected() {
        let (dispatcher, _) = dispatcher();
        let foreign = dispatcher.handle_bytes(&request(json!({
            "msg_type": "status_request",
            "namespace": "other",
        })));
        assert!(matches!(foreign, ControlResponse::Rejected { .. }));

        let own = dispatcher.handle_bytes(&request(json!({
            "msg_type": "status_request",
            "namespace": "testbed",
        })));
        assert!(matches!(own, ControlResponse::StatusResponse { .. }));

        let garbage = dispatcher.handle_bytes(b"{not json");
        assert!(matches!(garbage, ControlResponse::Rejected { .. }));
        let unknown_type = dispatcher.handle_bytes(&request(json!({"msg_type": "reboot"})));
        assert!(matches!(unknown_type, ControlResponse::Rejected { .. }));
    }

    struct OneshotReply(oneshot::Sender<ControlResponse>);

    #[async_trait]
    impl ReplyHandle for OneshotReply {
        async fn reply(self: Box<Self>, response: &ControlResponse) -> Result<(), PublishError> {
            self.0.send(response.clone()).map_err(|unsent| PublishError::Transport {
                message: format!("reply receiver dropped before {}", unsent.msg_type()),
            })
        }
    }

    /// Never completes, simulating a stalled reply path.
    struct StalledReply;

    #[async_trait]
    impl ReplyHandle for StalledReply {
        async fn reply(self: Box<Self>, _response: &ControlResponse) -> Result<(), PublishError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn listener_replies_and_keeps_receiving() {
        let (dispatcher, _) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let (tx, rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(run_listener(Arc::clone(&dispatcher), rx, cancel.clone()));

        // A long run and a stalled reply must not delay the next request.
        tx.unbounded_send(InboundControl {
            payload: request(json!({
                "msg_type": "run_workflow",
                "realtime": true,
                "params": {"physics_period_duration": 3600},
            })),
            reply: Some(Box::new(StalledReply)),
        })
        .unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.unbounded_send(InboundControl {
            payload: request(json!({"msg_type": "status_request"})),
            reply: Some(Box::new(OneshotReply(reply_tx))),
        })
        .unwrap();

        let response = tokio::time::timeout(WAIT, reply_rx).await.unwrap().unwrap();
        match response {
            ControlResponse::StatusResponse { executions } => assert_eq!(executions.len(), 1),
            other => panic!("expected status_response, got {other:?}"),
        }

        cancel.cancel();
        assert_eq!(listener.await.unwrap(), ListenerExit::Shutdown);
        assert!(dispatcher.supervisor().shutdown(WAIT).await);
    }

    #[tokio::test]
    async fn listener_reports_closed_stream() {
        let (dispatcher, _) = dispatcher();
        let (tx, rx) = mpsc::unbounded::<InboundControl>();
        drop(tx);
        let exit = run_listener(Arc::new(dispatcher), rx, CancellationToken::new()).await;
        assert_eq!(exit, ListenerExit::StreamEnded);
    }
}
