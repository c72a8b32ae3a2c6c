//! Wire messages exchanged over the bus and the control channel.
//!
//! All messages are JSON objects tagged by a `msg_type` field. Emitted
//! events use [`BusMessage`]; the control protocol uses
//! [`ControlRequest`] inbound and [`ControlResponse`] on the reply path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::enums::ExecutionStatus;
use crate::ids::{ExecutionId, RunNumber};
use crate::structs::{
    DataUnitMessage, EndRunNotification, ExecutionSnapshot, Heartbeat, RunNotification,
    StatusReport,
};

/// Workflow kind used when a run request does not name one.
pub const DEFAULT_WORKFLOW: &str = "stf_datataking";

// ---------------------------------------------------------------------------
// Outbound bus messages
// ---------------------------------------------------------------------------

/// Every message the engine publishes on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum BusMessage {
    /// The run is about to start.
    RunImminent(RunNotification),
    /// First physics period begins.
    StartRun(RunNotification),
    /// Physics period over, entering standby.
    PauseRun(RunNotification),
    /// Next physics period begins.
    ResumeRun(RunNotification),
    /// The run has ended.
    EndRun(EndRunNotification),
    /// A data unit was produced.
    StfGen(DataUnitMessage),
    /// Execution reached `completed`.
    WorkflowCompleted(StatusReport),
    /// Execution reached `stopped`.
    WorkflowStopped(StatusReport),
    /// Execution reached `failed`.
    WorkflowFailed(StatusReport),
    /// Engine liveness beat.
    Heartbeat(Heartbeat),
}

impl BusMessage {
    /// The `msg_type` tag of this message.
    pub const fn msg_type(&self) -> &'static str {
        match self {
            Self::RunImminent(_) => "run_imminent",
            Self::StartRun(_) => "start_run",
            Self::PauseRun(_) => "pause_run",
            Self::ResumeRun(_) => "resume_run",
            Self::EndRun(_) => "end_run",
            Self::StfGen(_) => "stf_gen",
            Self::WorkflowCompleted(_) => "workflow_completed",
            Self::WorkflowStopped(_) => "workflow_stopped",
            Self::WorkflowFailed(_) => "workflow_failed",
            Self::Heartbeat(_) => "heartbeat",
        }
    }

    /// Execution the message belongs to, if any.
    pub const fn execution_id(&self) -> Option<&ExecutionId> {
        match self {
            Self::RunImminent(n) | Self::StartRun(n) | Self::PauseRun(n) | Self::ResumeRun(n) => {
                Some(&n.execution_id)
            }
            Self::EndRun(n) => Some(&n.execution_id),
            Self::StfGen(u) => Some(&u.execution_id),
            Self::WorkflowCompleted(r) | Self::WorkflowStopped(r) | Self::WorkflowFailed(r) => {
                Some(&r.execution_id)
            }
            Self::Heartbeat(_) => None,
        }
    }

    /// Wrap a terminal status report in the matching variant.
    ///
    /// Returns `None` for [`ExecutionStatus::Running`].
    pub fn for_report(report: StatusReport) -> Option<Self> {
        match report.status {
            ExecutionStatus::Running => None,
            ExecutionStatus::Completed => Some(Self::WorkflowCompleted(report)),
            ExecutionStatus::Stopped => Some(Self::WorkflowStopped(report)),
            ExecutionStatus::Failed => Some(Self::WorkflowFailed(report)),
        }
    }
}

// ---------------------------------------------------------------------------
// Control requests
// ---------------------------------------------------------------------------

/// Inbound control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Start a new execution.
    RunWorkflow(RunWorkflowRequest),
    /// Cancel a running execution.
    StopWorkflow(StopWorkflowRequest),
    /// Query one or all executions.
    StatusRequest(StatusQuery),
}

impl ControlRequest {
    /// Namespace the request is addressed to, if it names one.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::RunWorkflow(r) => r.namespace.as_deref(),
            Self::StopWorkflow(r) => r.namespace.as_deref(),
            Self::StatusRequest(r) => r.namespace.as_deref(),
        }
    }

    /// The `msg_type` tag of this request.
    pub const fn msg_type(&self) -> &'static str {
        match self {
            Self::RunWorkflow(_) => "run_workflow",
            Self::StopWorkflow(_) => "stop_workflow",
            Self::StatusRequest(_) => "status_request",
        }
    }
}

/// Body of a `run_workflow` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWorkflowRequest {
    /// Namespace the request is addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Workflow kind, `[a-z0-9_]+`.
    #[serde(default = "default_workflow_name")]
    pub workflow_name: String,
    /// Name of the parameter profile to start from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Pace the execution by the wall clock. Engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime: Option<bool>,
    /// Parameter overrides layered on top of the profile.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Operator identity. Engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
}

impl Default for RunWorkflowRequest {
    fn default() -> Self {
        Self {
            namespace: None,
            workflow_name: default_workflow_name(),
            config: None,
            realtime: None,
            params: Map::new(),
            executed_by: None,
        }
    }
}

fn default_workflow_name() -> String {
    DEFAULT_WORKFLOW.to_owned()
}

/// Body of a `stop_workflow` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopWorkflowRequest {
    /// Namespace the request is addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Execution to cancel.
    pub execution_id: ExecutionId,
}

/// Body of a `status_request`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusQuery {
    /// Namespace the request is addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Execution to report on; all known executions when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

// ---------------------------------------------------------------------------
// Control responses
// ---------------------------------------------------------------------------

/// Response to a control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// A new execution was started.
    WorkflowStarted {
        /// Identifier of the new execution.
        execution_id: ExecutionId,
        /// Run number allocated to it.
        run_id: RunNumber,
    },
    /// The run request's parameters failed validation; nothing started.
    ValidationError {
        /// What is wrong with the parameters.
        reason: String,
    },
    /// The cancellation signal is set; the execution stops at its next
    /// checkpoint.
    StopAccepted {
        /// Execution being stopped.
        execution_id: ExecutionId,
        /// Whether an earlier stop had already set the signal.
        already_requested: bool,
    },
    /// No execution with this id is known.
    NotFound {
        /// The unknown identifier.
        execution_id: ExecutionId,
    },
    /// The execution already reached a terminal status.
    AlreadyFinished {
        /// The finished execution.
        execution_id: ExecutionId,
        /// Its terminal status.
        status: ExecutionStatus,
    },
    /// Status snapshots.
    StatusResponse {
        /// One snapshot per matching execution.
        executions: Vec<ExecutionSnapshot>,
    },
    /// The request could not be processed (malformed or misaddressed).
    Rejected {
        /// Why the request was rejected.
        reason: String,
    },
}

impl ControlResponse {
    /// Whether the request achieved what it asked for.
    pub const fn is_success(&self) -> bool {
        matches!(
            self,
            Self::WorkflowStarted { .. } | Self::StopAccepted { .. } | Self::StatusResponse { .. }
        )
    }

    /// The `msg_type` tag of this response.
    pub const fn msg_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::ValidationError { .. } => "validation_error",
            Self::StopAccepted { .. } => "stop_accepted",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyFinished { .. } => "already_finished",
            Self::StatusResponse { .. } => "status_response",
            Self::Rejected { .. } => "rejected",
        }
    }
}
