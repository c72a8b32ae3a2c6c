//! Execution supervisor: runs phase sequencers on their own tasks.
//!
//! The supervisor owns the registry of executions. [`start`] allocates an
//! id and run number, inserts a live entry, and spawns the sequencer; it
//! returns without waiting for the run. Every execution task delivers its
//! events through the shared [`EventPublisher`] with bounded retries,
//! records its terminal status, publishes a status report, and only then
//! moves from the live registry into a bounded finished history.
//!
//! # Isolation
//!
//! A panic or error inside one execution is caught at the task boundary
//! and recorded as `failed` with a reason. The registry lock is held only
//! for lookups and inserts, never across an emission or a wait.
//!
//! [`start`]: ExecutionSupervisor::start

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use daqflow_types::{
    BusMessage, DataUnitMessage, Destination, EndRunNotification, ExecutionId, ExecutionSnapshot,
    ExecutionStatus, NotificationKind, Phase, RunNotification, RunNumber, StatusReport,
};
use futures::FutureExt as _;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::clock_for;
use crate::params::ParameterSet;
use crate::progress::ExecutionProgress;
use crate::publisher::{EventPublisher, RetryPolicy};
use crate::sequencer::{
    DataUnit, Emitter, PhaseSequencer, SequencerError, SequencerEvent, SequencerOutcome,
};

/// Errors returned by supervisor operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// No execution with this id is known.
    #[error("execution {execution_id} not found")]
    NotFound {
        /// The unknown identifier.
        execution_id: ExecutionId,
    },

    /// The execution already reached a terminal status.
    #[error("execution {execution_id} already finished with status {status}")]
    AlreadyFinished {
        /// The finished execution.
        execution_id: ExecutionId,
        /// Its terminal status.
        status: ExecutionStatus,
    },

    /// The supervisor is shutting down and accepts no new executions.
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Effect of a successful [`ExecutionSupervisor::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// This call set the cancellation signal.
    Signalled,
    /// The signal was already set by an earlier call.
    AlreadySignalled,
}

/// Static settings shared by every execution.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Engine namespace stamped on every message.
    pub namespace: Option<String>,
    /// Destination of run notifications and data units.
    pub events: Destination,
    /// Destination of terminal status reports.
    pub status: Destination,
    /// Delivery retry policy.
    pub retry: RetryPolicy,
    /// First run number to allocate.
    pub run_number_start: u64,
    /// Finished executions kept for status queries.
    pub retain_finished: usize,
}

/// A request to start one execution with resolved parameters.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Workflow kind, used in the execution id.
    pub workflow_name: String,
    /// Operator identity, used in the execution id.
    pub operator: String,
    /// Validated parameters.
    pub params: ParameterSet,
    /// Pace the execution by the wall clock.
    pub realtime: bool,
}

/// Identity of a newly started execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    /// The allocated execution id.
    pub execution_id: ExecutionId,
    /// The allocated run number.
    pub run_id: RunNumber,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct LiveEntry {
    progress: Arc<ExecutionProgress>,
    cancel: CancellationToken,
}

struct Registry {
    live: BTreeMap<ExecutionId, LiveEntry>,
    finished: VecDeque<ExecutionSnapshot>,
    sequences: BTreeMap<String, u32>,
    next_run: u64,
    accepting: bool,
}

impl Registry {
    fn finished(&self, id: &ExecutionId) -> Option<&ExecutionSnapshot> {
        self.finished.iter().rev().find(|s| &s.execution_id == id)
    }
}

struct Inner {
    settings: SupervisorSettings,
    publisher: Arc<dyn EventPublisher>,
    registry: Mutex<Registry>,
    root: CancellationToken,
    retired: Notify,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retire(&self, id: &ExecutionId) {
        {
            let mut reg = self.registry();
            if let Some(entry) = reg.live.remove(id) {
                reg.finished.push_back(entry.progress.snapshot());
                while reg.finished.len() > self.settings.retain_finished {
                    let _ = reg.finished.pop_front();
                }
            }
        }
        self.retired.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Starts, tracks and cancels executions. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionSupervisor {
    inner: Arc<Inner>,
}

impl ExecutionSupervisor {
    /// Create a supervisor publishing through `publisher`.
    ///
    /// Execution cancellation tokens are children of `root`, so cancelling
    /// `root` stops every execution.
    pub fn new(
        settings: SupervisorSettings,
        publisher: Arc<dyn EventPublisher>,
        root: CancellationToken,
    ) -> Self {
        let next_run = settings.run_number_start;
        Self {
            inner: Arc::new(Inner {
                settings,
                publisher,
                registry: Mutex::new(Registry {
                    live: BTreeMap::new(),
                    finished: VecDeque::new(),
                    sequences: BTreeMap::new(),
                    next_run,
                    accepting: true,
                }),
                root,
                retired: Notify::new(),
            }),
        }
    }

    /// Start an execution on its own task and return its identity.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, request: StartRequest) -> Result<Started, SupervisorError> {
        let cancel = self.inner.root.child_token();
        let progress = {
            let mut reg = self.inner.registry();
            if !reg.accepting || self.inner.root.is_cancelled() {
                return Err(SupervisorError::ShuttingDown);
            }
            let sequence = {
                let counter = reg
                    .sequences
                    .entry(request.workflow_name.clone())
                    .or_insert(0);
                *counter = counter.saturating_add(1);
                *counter
            };
            let run_id = RunNumber(reg.next_run);
            reg.next_run = reg.next_run.saturating_add(1);

            let execution_id =
                ExecutionId::compose(&request.workflow_name, &request.operator, sequence);
            let progress = Arc::new(ExecutionProgress::new(
                execution_id.clone(),
                request.workflow_name.clone(),
                run_id,
                request.realtime,
            ));
            reg.live.insert(
                execution_id,
                LiveEntry {
                    progress: Arc::clone(&progress),
                    cancel: cancel.clone(),
                },
            );
            progress
        };

        let started = Started {
            execution_id: progress.execution_id().clone(),
            run_id: progress.run_id(),
        };
        info!(
            execution_id = %started.execution_id,
            run_id = %started.run_id,
            workflow = %request.workflow_name,
            realtime = request.realtime,
            unit_bound = ?request.params.unit_bound(),
            unbounded = request.params.is_unbounded(),
            "Execution started"
        );
        if request.params.is_unbounded() {
            warn!(
                execution_id = %started.execution_id,
                "Execution has no unit, duration or period bound and runs until stopped"
            );
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_execution(
            inner,
            progress,
            cancel,
            request.params,
            request.realtime,
        ));
        Ok(started)
    }

    /// Set the cancellation signal of a running execution. Idempotent.
    pub fn cancel(&self, id: &ExecutionId) -> Result<CancelOutcome, SupervisorError> {
        let reg = self.inner.registry();
        if let Some(entry) = reg.live.get(id) {
            let status = entry.progress.status();
            if status.is_terminal() {
                return Err(SupervisorError::AlreadyFinished {
                    execution_id: id.clone(),
                    status,
                });
            }
            if entry.cancel.is_cancelled() {
                return Ok(CancelOutcome::AlreadySignalled);
            }
            entry.cancel.cancel();
            info!(execution_id = %id, phase = %entry.progress.phase(), "Cancellation signalled");
            return Ok(CancelOutcome::Signalled);
        }
        match reg.finished(id) {
            Some(snapshot) => Err(SupervisorError::AlreadyFinished {
                execution_id: id.clone(),
                status: snapshot.status,
            }),
            None => Err(SupervisorError::NotFound {
                execution_id: id.clone(),
            }),
        }
    }

    /// Snapshot of one execution, live or finished.
    pub fn status(&self, id: &ExecutionId) -> Result<ExecutionSnapshot, SupervisorError> {
        let progress = {
            let reg = self.inner.registry();
            match reg.live.get(id) {
                Some(entry) => Arc::clone(&entry.progress),
                None => {
                    return reg.finished(id).cloned().ok_or_else(|| SupervisorError::NotFound {
                        execution_id: id.clone(),
                    });
                }
            }
        };
        Ok(progress.snapshot())
    }

    /// Snapshots of every known execution, oldest first.
    pub fn status_all(&self) -> Vec<ExecutionSnapshot> {
        let (live, mut snapshots) = {
            let reg = self.inner.registry();
            let live: Vec<Arc<ExecutionProgress>> =
                reg.live.values().map(|e| Arc::clone(&e.progress)).collect();
            (live, reg.finished.iter().cloned().collect::<Vec<_>>())
        };
        snapshots.extend(live.iter().map(|p| p.snapshot()));
        snapshots.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        snapshots
    }

    /// Number of executions that have not yet been retired.
    pub fn running_count(&self) -> usize {
        self.inner.registry().live.len()
    }

    /// Wait until `id` is retired, up to `timeout`.
    ///
    /// Returns the final snapshot, or `None` on timeout or unknown id.
    pub async fn wait_finished(
        &self,
        id: &ExecutionId,
        timeout: Duration,
    ) -> Option<ExecutionSnapshot> {
        let deadline = tokio::time::Instant::now().checked_add(timeout)?;
        loop {
            let notified = self.inner.retired.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let reg = self.inner.registry();
                if !reg.live.contains_key(id) {
                    return reg.finished(id).cloned();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Stop accepting executions, cancel all running ones, and wait up to
    /// `grace` for them to retire.
    ///
    /// Returns `true` if every execution retired in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.registry().accepting = false;
        self.inner.root.cancel();
        let Some(deadline) = tokio::time::Instant::now().checked_add(grace) else {
            return self.running_count() == 0;
        };
        loop {
            let notified = self.inner.retired.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let remaining = self.running_count();
            if remaining == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let remaining = self.running_count();
                if remaining > 0 {
                    warn!(remaining, "Executions still running after shutdown grace period");
                }
                return remaining == 0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Execution task
// ---------------------------------------------------------------------------

async fn run_execution(
    inner: Arc<Inner>,
    progress: Arc<ExecutionProgress>,
    cancel: CancellationToken,
    params: ParameterSet,
    realtime: bool,
) {
    let clock = clock_for(realtime);
    let mut emitter = BusEmitter {
        inner: Arc::clone(&inner),
        progress: Arc::clone(&progress),
        cancel: cancel.clone(),
    };

    let run = PhaseSequencer::new(&params, clock.as_ref(), &cancel).run(&mut emitter);
    let (status, reason) = match AssertUnwindSafe(run).catch_unwind().await {
        Ok(Ok(SequencerOutcome::Completed { .. })) => (ExecutionStatus::Completed, None),
        Ok(Ok(SequencerOutcome::Stopped { .. })) => (ExecutionStatus::Stopped, None),
        Ok(Err(e)) => (ExecutionStatus::Failed, Some(e.to_string())),
        Err(panic) => (
            ExecutionStatus::Failed,
            Some(format!("execution panicked: {}", panic_message(panic.as_ref()))),
        ),
    };

    let id = progress.execution_id().clone();
    if clock.is_realtime() && !clock.lag().is_zero() {
        debug!(
            execution_id = %id,
            lag_ms = u64::try_from(clock.lag().as_millis()).unwrap_or(u64::MAX),
            "Real-time execution ran behind its nominal schedule"
        );
    }

    let _ = progress.finish(status, reason.clone());
    match status {
        ExecutionStatus::Failed => error!(
            execution_id = %id,
            units = progress.units_emitted(),
            reason = reason.as_deref().unwrap_or_default(),
            "Execution failed"
        ),
        _ => info!(
            execution_id = %id,
            status = %status,
            units = progress.units_emitted(),
            "Execution finished"
        ),
    }

    let report = StatusReport {
        execution_id: id.clone(),
        run_id: progress.run_id(),
        namespace: inner.settings.namespace.clone(),
        status,
        units_emitted: progress.units_emitted(),
        reason,
        timestamp: Utc::now(),
    };
    if let Some(message) = BusMessage::for_report(report) {
        // The execution token may already be cancelled; the report is
        // retried regardless.
        let report_cancel = CancellationToken::new();
        if let Err(e) = inner
            .settings
            .retry
            .publish(
                inner.publisher.as_ref(),
                &inner.settings.status,
                &message,
                &report_cancel,
            )
            .await
        {
            error!(execution_id = %id, error = %e, "Failed to publish terminal status report");
        }
    }

    inner.retire(&id);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Turns sequencer events into bus messages for one execution.
struct BusEmitter {
    inner: Arc<Inner>,
    progress: Arc<ExecutionProgress>,
    cancel: CancellationToken,
}

impl BusEmitter {
    fn notification(&self, kind: NotificationKind, tick: Duration, units: u64) -> BusMessage {
        let execution_id = self.progress.execution_id().clone();
        let run_id = self.progress.run_id();
        let namespace = self.inner.settings.namespace.clone();
        let timestamp = Utc::now();
        let simulation_tick = tick.as_secs_f64();
        let run = |state: &str, substate: &str, reason: Option<String>| RunNotification {
            execution_id: execution_id.clone(),
            run_id,
            namespace: namespace.clone(),
            timestamp,
            simulation_tick,
            state: state.to_owned(),
            substate: substate.to_owned(),
            reason,
        };
        match kind {
            NotificationKind::Imminent => BusMessage::RunImminent(run("beam", "not_ready", None)),
            NotificationKind::Start => BusMessage::StartRun(run("run", "physics", None)),
            NotificationKind::Resume => BusMessage::ResumeRun(run("run", "physics", None)),
            NotificationKind::Pause => BusMessage::PauseRun(run(
                "run",
                "standby",
                Some("standby between physics periods".to_owned()),
            )),
            NotificationKind::End => BusMessage::EndRun(EndRunNotification {
                execution_id: execution_id.clone(),
                run_id,
                namespace: namespace.clone(),
                timestamp,
                simulation_tick,
                total_stf_files: units,
            }),
        }
    }

    fn data_unit(&self, unit: DataUnit) -> BusMessage {
        let run_id = self.progress.run_id();
        let start = Utc::now();
        let cost = chrono::Duration::from_std(unit.cost).unwrap_or_else(|_| chrono::Duration::zero());
        BusMessage::StfGen(DataUnitMessage {
            execution_id: self.progress.execution_id().clone(),
            run_id,
            namespace: self.inner.settings.namespace.clone(),
            sequence: unit.sequence,
            filename: format!("swf.{run_id}.{:06}.stf", unit.sequence),
            timestamp: start,
            simulation_tick: unit.tick.as_secs_f64(),
            start,
            end: start.checked_add_signed(cost).unwrap_or(start),
            state: "run".to_owned(),
            substate: "physics".to_owned(),
        })
    }
}

#[async_trait]
impl Emitter for BusEmitter {
    async fn emit(&mut self, event: SequencerEvent) -> Result<(), SequencerError> {
        let (message, sequence) = match event {
            SequencerEvent::Notification {
                kind,
                tick,
                units_so_far,
            } => (self.notification(kind, tick, units_so_far), None),
            SequencerEvent::DataUnit(unit) => (self.data_unit(unit), Some(unit.sequence)),
        };

        self.inner
            .settings
            .retry
            .publish(
                self.inner.publisher.as_ref(),
                &self.inner.settings.events,
                &message,
                &self.cancel,
            )
            .await?;

        if let Some(sequence) = sequence {
            self.progress.set_units_emitted(sequence);
            debug!(
                execution_id = %self.progress.execution_id(),
                sequence,
                msg_type = message.msg_type(),
                "Data unit emitted"
            );
        } else {
            info!(
                execution_id = %self.progress.execution_id(),
                run_id = %self.progress.run_id(),
                msg_type = message.msg_type(),
                "Run notification emitted"
            );
        }
        Ok(())
    }

    fn on_phase(&mut self, phase: Phase) {
        self.progress.set_phase(phase);
    }

    fn on_tick(&mut self, tick: Duration) {
        self.progress.set_tick(tick);
    }
}
