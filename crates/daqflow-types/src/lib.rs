//! Shared type definitions for the DAQflow workflow execution engine.
//!
//! This crate is the single source of truth for every value that crosses
//! a crate or process boundary: identifiers, phases and statuses, bus
//! destinations, and the JSON wire messages of the event stream and the
//! control protocol. Snapshot and heartbeat types flow to `TypeScript`
//! via `ts-rs` for the run dashboard.
//!
//! # Modules
//!
//! - [`ids`] -- Execution identifiers and DAQ run numbers
//! - [`enums`] -- Phases, statuses, notification kinds, disciplines
//! - [`destination`] -- Bus destinations with an explicit discipline
//! - [`structs`] -- Message payloads, execution snapshots, heartbeats
//! - [`messages`] -- `msg_type`-tagged bus and control messages

pub mod destination;
pub mod enums;
pub mod ids;
pub mod messages;
pub mod structs;

pub use destination::{Destination, DestinationError};
pub use enums::{Discipline, ExecutionStatus, LivenessStatus, NotificationKind, Phase};
pub use ids::{ExecutionId, RunNumber};
pub use messages::{
    BusMessage, ControlRequest, ControlResponse, DEFAULT_WORKFLOW, RunWorkflowRequest,
    StatusQuery, StopWorkflowRequest,
};
pub use structs::{
    DataUnitMessage, EndRunNotification, ExecutionSnapshot, Heartbeat, RunNotification,
    StatusReport,
};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation for the dashboard types.

    #[test]
    fn export_bindings() {
        use ts_rs::TS;

        let _ = crate::ids::ExecutionId::export_all();
        let _ = crate::ids::RunNumber::export_all();
        let _ = crate::enums::Phase::export_all();
        let _ = crate::enums::ExecutionStatus::export_all();
        let _ = crate::enums::LivenessStatus::export_all();
        let _ = crate::structs::ExecutionSnapshot::export_all();
        let _ = crate::structs::Heartbeat::export_all();
    }
}
