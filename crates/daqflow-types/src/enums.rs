//! Enumeration types for the DAQflow engine.
//!
//! Phases of the DAQ run lifecycle, terminal statuses of an execution,
//! kinds of run notifications, and the delivery discipline of a bus
//! destination.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One step of the DAQ lifecycle state machine.
///
/// Transitions are strictly forward along
/// `idle -> imminent -> ready -> physics -> ended`, except that
/// `physics` and `standby` may alternate any number of times. A run whose
/// logical duration bound expires before or between physics periods ends
/// from `ready` or `standby`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Phase {
    /// Before the run: no beam, detector not ready.
    Idle,
    /// Run is imminent: beam present, detector not ready.
    Imminent,
    /// Beam and detector ready, physics not yet started.
    Ready,
    /// Physics data taking; data units are emitted.
    Physics,
    /// Paused between two physics periods.
    Standby,
    /// The run has ended. Terminal.
    Ended,
}

impl Phase {
    /// Lowercase wire name of the phase.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Imminent => "imminent",
            Self::Ready => "ready",
            Self::Physics => "physics",
            Self::Standby => "standby",
            Self::Ended => "ended",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Imminent)
                | (Self::Imminent, Self::Ready)
                | (Self::Ready | Self::Standby, Self::Physics)
                | (Self::Physics, Self::Standby)
                | (Self::Ready | Self::Physics, Self::Ended)
        )
    }

    /// Compact encoding used to keep the phase in an atomic cell.
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Imminent => 1,
            Self::Ready => 2,
            Self::Physics => 3,
            Self::Standby => 4,
            Self::Ended => 5,
        }
    }

    /// Inverse of [`to_u8`](Self::to_u8). Unknown values decode as `Ended`.
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Imminent,
            2 => Self::Ready,
            3 => Self::Physics,
            4 => Self::Standby,
            _ => Self::Ended,
        }
    }
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ExecutionStatus {
    /// The sequencer is still advancing.
    Running,
    /// Reached `ended` through its unit, duration or period bound.
    Completed,
    /// Cancelled by an operator before reaching `ended`.
    Stopped,
    /// Terminated by a transport or internal fault.
    Failed,
}

impl ExecutionStatus {
    /// Whether this status is final.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Lowercase wire name of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl core::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Kind of run-level notification emitted at a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Entering `imminent`.
    Imminent,
    /// First physics period begins.
    Start,
    /// Physics period over, entering `standby`.
    Pause,
    /// Leaving `standby` for the next physics period.
    Resume,
    /// The run has ended.
    End,
}

impl NotificationKind {
    /// The `msg_type` this notification is published under.
    pub const fn msg_type(self) -> &'static str {
        match self {
            Self::Imminent => "run_imminent",
            Self::Start => "start_run",
            Self::Pause => "pause_run",
            Self::Resume => "resume_run",
            Self::End => "end_run",
        }
    }

    /// The phase the execution is in once the notification is emitted.
    pub const fn phase(self) -> Phase {
        match self {
            Self::Imminent => Phase::Imminent,
            Self::Start | Self::Resume => Phase::Physics,
            Self::Pause => Phase::Standby,
            Self::End => Phase::Ended,
        }
    }
}

// ---------------------------------------------------------------------------
// Destinations and liveness
// ---------------------------------------------------------------------------

/// Delivery discipline of a bus destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    /// Every subscriber receives every message.
    Broadcast,
    /// Each message goes to exactly one of the competing consumers.
    PointToPoint,
}

impl Discipline {
    /// Path prefix that declares this discipline in a destination reference.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Broadcast => "/topic/",
            Self::PointToPoint => "/queue/",
        }
    }
}

/// Health reported in a liveness heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum LivenessStatus {
    /// All loops are running.
    #[serde(rename = "OK")]
    Ok,
    /// The engine is alive but a component has stopped (usually the
    /// control listener).
    #[serde(rename = "WARNING")]
    Warning,
}
