//! Shared progress state of one execution.
//!
//! The execution task is the only writer; status queries from the control
//! listener and the HTTP API are readers. Hot-path fields are atomics so a
//! snapshot never waits on the running sequencer.
//!
//! # Architecture
//!
//! Phase, unit count, logical tick and status live in atomic cells. The
//! two rarely-written terminal fields (reason, finish time) sit behind a
//! [`std::sync::Mutex`] that is only held to copy a value in or out.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use daqflow_types::{ExecutionId, ExecutionSnapshot, ExecutionStatus, Phase, RunNumber};

const STATUS_RUNNING: u8 = 0;
const STATUS_COMPLETED: u8 = 1;
const STATUS_STOPPED: u8 = 2;
const STATUS_FAILED: u8 = 3;

const fn encode_status(status: ExecutionStatus) -> u8 {
    match status {
        ExecutionStatus::Running => STATUS_RUNNING,
        ExecutionStatus::Completed => STATUS_COMPLETED,
        ExecutionStatus::Stopped => STATUS_STOPPED,
        ExecutionStatus::Failed => STATUS_FAILED,
    }
}

const fn decode_status(raw: u8) -> ExecutionStatus {
    match raw {
        STATUS_RUNNING => ExecutionStatus::Running,
        STATUS_COMPLETED => ExecutionStatus::Completed,
        STATUS_STOPPED => ExecutionStatus::Stopped,
        _ => ExecutionStatus::Failed,
    }
}

/// Terminal details written once when the execution finishes.
#[derive(Debug, Default)]
struct Terminal {
    reason: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

/// Live progress of one execution.
#[derive(Debug)]
pub struct ExecutionProgress {
    /// Execution identifier.
    execution_id: ExecutionId,
    /// Workflow kind.
    workflow_name: String,
    /// DAQ run number.
    run_id: RunNumber,
    /// Whether the execution runs on the real-time clock.
    realtime: bool,
    /// Wall-clock start time.
    started_at: DateTime<Utc>,
    /// Current phase, encoded with [`Phase::to_u8`].
    phase: AtomicU8,
    /// Data units emitted so far.
    units: AtomicU64,
    /// Latest logical time in nanoseconds.
    tick_nanos: AtomicU64,
    /// Execution status, encoded.
    status: AtomicU8,
    /// Reason and finish time.
    terminal: Mutex<Terminal>,
}

impl ExecutionProgress {
    /// Create progress for an execution that is about to start.
    pub fn new(
        execution_id: ExecutionId,
        workflow_name: String,
        run_id: RunNumber,
        realtime: bool,
    ) -> Self {
        Self {
            execution_id,
            workflow_name,
            run_id,
            realtime,
            started_at: Utc::now(),
            phase: AtomicU8::new(Phase::Idle.to_u8()),
            units: AtomicU64::new(0),
            tick_nanos: AtomicU64::new(0),
            status: AtomicU8::new(STATUS_RUNNING),
            terminal: Mutex::new(Terminal::default()),
        }
    }

    /// Execution identifier.
    pub const fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// DAQ run number.
    pub const fn run_id(&self) -> RunNumber {
        self.run_id
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Record a phase transition.
    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.to_u8(), Ordering::Release);
    }

    /// Data units emitted so far.
    pub fn units_emitted(&self) -> u64 {
        self.units.load(Ordering::Acquire)
    }

    /// Record the sequence number of the latest emitted unit.
    pub fn set_units_emitted(&self, units: u64) {
        self.units.store(units, Ordering::Release);
    }

    /// Record the latest logical time.
    pub fn set_tick(&self, tick: Duration) {
        let nanos = u64::try_from(tick.as_nanos()).unwrap_or(u64::MAX);
        self.tick_nanos.store(nanos, Ordering::Release);
    }

    /// Latest logical time.
    pub fn tick(&self) -> Duration {
        Duration::from_nanos(self.tick_nanos.load(Ordering::Acquire))
    }

    /// Current status.
    pub fn status(&self) -> ExecutionStatus {
        decode_status(self.status.load(Ordering::Acquire))
    }

    /// Record the terminal status. Only the first call has an effect.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn finish(&self, status: ExecutionStatus, reason: Option<String>) -> bool {
        if !status.is_terminal() {
            return false;
        }
        {
            let mut terminal = self.terminal.lock().unwrap_or_else(PoisonError::into_inner);
            if terminal.finished_at.is_some() {
                return false;
            }
            terminal.reason = reason;
            terminal.finished_at = Some(Utc::now());
        }
        self.status.store(encode_status(status), Ordering::Release);
        true
    }

    /// Non-blocking point-in-time view.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let (reason, finished_at) = {
            let terminal = self.terminal.lock().unwrap_or_else(PoisonError::into_inner);
            (terminal.reason.clone(), terminal.finished_at)
        };
        ExecutionSnapshot {
            execution_id: self.execution_id.clone(),
            workflow_name: self.workflow_name.clone(),
            run_id: self.run_id,
            phase: self.phase(),
            units_emitted: self.units_emitted(),
            simulation_tick: self.tick().as_secs_f64(),
            status: self.status(),
            realtime: self.realtime,
            started_at: self.started_at,
            finished_at,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> ExecutionProgress {
        ExecutionProgress::new(
            ExecutionId::from("stf_datataking-test-0001"),
            "stf_datataking".to_owned(),
            RunNumber(7),
            false,
        )
    }

    #[test]
    fn starts_idle_and_running() {
        let p = progress();
        let snap = p.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert_eq!(snap.status, ExecutionStatus::Running);
        assert_eq!(snap.units_emitted, 0);
        assert!(snap.finished_at.is_none());
    }

    #[test]
    fn records_phase_units_and_tick() {
        let p = progress();
        p.set_phase(Phase::Physics);
        p.set_units_emitted(3);
        p.set_tick(Duration::from_millis(4_500));

        let snap = p.snapshot();
        assert_eq!(snap.phase, Phase::Physics);
        assert_eq!(snap.units_emitted, 3);
        assert!((snap.simulation_tick - 4.5).abs() < 1e-9);
    }

    #[test]
    fn finish_is_set_once() {
        let p = progress();
        assert!(!p.finish(ExecutionStatus::Running, None));
        assert!(p.finish(ExecutionStatus::Failed, Some("bus down".to_owned())));
        assert!(!p.finish(ExecutionStatus::Completed, None));

        let snap = p.snapshot();
        assert_eq!(snap.status, ExecutionStatus::Failed);
        assert_eq!(snap.reason.as_deref(), Some("bus down"));
        assert!(snap.finished_at.is_some());
    }
}
