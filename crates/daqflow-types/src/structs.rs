//! Payload structs carried by bus messages and served by the status API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{ExecutionStatus, LivenessStatus, Phase};
use crate::ids::{ExecutionId, RunNumber};

// ---------------------------------------------------------------------------
// Run notifications
// ---------------------------------------------------------------------------

/// Phase-transition notification (`run_imminent`, `start_run`,
/// `pause_run`, `resume_run`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNotification {
    /// Execution that produced the notification.
    pub execution_id: ExecutionId,
    /// DAQ run number of the execution.
    pub run_id: RunNumber,
    /// Engine namespace, if one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Wall-clock emission time.
    pub timestamp: DateTime<Utc>,
    /// Logical time in seconds since the execution started.
    pub simulation_tick: f64,
    /// Coarse detector state (`beam`, `run`).
    pub state: String,
    /// Fine detector state (`not_ready`, `physics`, `standby`).
    pub substate: String,
    /// Optional human-readable reason (set on `pause_run`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Final `end_run` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndRunNotification {
    /// Execution that produced the notification.
    pub execution_id: ExecutionId,
    /// DAQ run number of the execution.
    pub run_id: RunNumber,
    /// Engine namespace, if one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Wall-clock emission time.
    pub timestamp: DateTime<Utc>,
    /// Logical time in seconds since the execution started.
    pub simulation_tick: f64,
    /// Number of data units produced over the whole run.
    pub total_stf_files: u64,
}

/// One emitted data unit (`stf_gen`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUnitMessage {
    /// Execution that produced the unit.
    pub execution_id: ExecutionId,
    /// DAQ run number of the execution.
    pub run_id: RunNumber,
    /// Engine namespace, if one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Sequence number, starting at 1 and strictly increasing per execution.
    pub sequence: u64,
    /// Filename of the unit, `swf.<run>.<sequence>.stf`.
    pub filename: String,
    /// Wall-clock emission time.
    pub timestamp: DateTime<Utc>,
    /// Logical time in seconds at emission.
    pub simulation_tick: f64,
    /// Wall-clock time the unit's generation window opened.
    pub start: DateTime<Utc>,
    /// Wall-clock time the unit's generation window is expected to close.
    pub end: DateTime<Utc>,
    /// Coarse detector state, always `run`.
    pub state: String,
    /// Fine detector state, always `physics`.
    pub substate: String,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Terminal status report published when an execution finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Execution that finished.
    pub execution_id: ExecutionId,
    /// DAQ run number of the execution.
    pub run_id: RunNumber,
    /// Engine namespace, if one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Data units emitted before termination.
    pub units_emitted: u64,
    /// Failure cause, present for `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Wall-clock time of the terminal transition.
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ExecutionSnapshot {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// Workflow kind the execution runs.
    pub workflow_name: String,
    /// DAQ run number.
    pub run_id: RunNumber,
    /// Current phase.
    pub phase: Phase,
    /// Data units emitted so far.
    pub units_emitted: u64,
    /// Latest logical time reached, in seconds.
    pub simulation_tick: f64,
    /// `running` or the terminal status.
    pub status: ExecutionStatus,
    /// Whether the execution is paced by the wall clock.
    pub realtime: bool,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Wall-clock time of the terminal transition.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure cause, present for `failed`.
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Periodic engine liveness beat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Heartbeat {
    /// Engine instance name.
    pub agent_name: String,
    /// Engine namespace, if one is configured.
    pub namespace: Option<String>,
    /// Overall health.
    pub status: LivenessStatus,
    /// Whether the control listener task is still receiving.
    pub listener_alive: bool,
    /// Executions currently running.
    pub running_executions: u64,
    /// Beat counter, starting at 1.
    pub sequence: u64,
    /// Wall-clock time of the beat.
    pub timestamp: DateTime<Utc>,
}
