//! Phase sequencer: the timed DAQ run state machine.
//!
//! The sequencer walks `idle -> imminent -> ready -> physics (<-> standby)
//! -> ended` for one [`ParameterSet`], pacing itself with a [`Clock`]. It
//! performs no I/O: every notification and data unit is handed to an
//! [`Emitter`], which owns delivery.
//!
//! # Checkpoints
//!
//! The cancellation token is checked before every wait and before every
//! emission. Once it is set the sequencer stops without emitting the
//! pending step and returns [`SequencerOutcome::Stopped`]. The only
//! exception is the post-run cooldown after `end_run`: the run has already
//! ended, so cancellation there still yields `Completed`.
//!
//! # Bounds
//!
//! - With a unit-count bound N, every period except the last is limited by
//!   its duration, and the last period (every period when the period count
//!   is 0) runs until N units exist. A completed run emits exactly N units.
//! - With only a duration bound, the run proceeds to `end_run` at the
//!   first checkpoint where logical time has reached it.
//! - With neither, the run ends after the configured number of periods.

use std::time::Duration;

use async_trait::async_trait;
use daqflow_types::{NotificationKind, Phase};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::{Clock, WaitOutcome};
use crate::params::ParameterSet;
use crate::publisher::PublishError;

/// Something the sequencer asks the outside world to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerEvent {
    /// A run-level notification at a phase transition.
    Notification {
        /// Which notification.
        kind: NotificationKind,
        /// Logical time of emission.
        tick: Duration,
        /// Units produced so far (the run total for `End`).
        units_so_far: u64,
    },
    /// One data unit.
    DataUnit(DataUnit),
}

/// One generated data unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataUnit {
    /// Sequence number, starting at 1.
    pub sequence: u64,
    /// Logical time of emission.
    pub tick: Duration,
    /// Generation cost the sequencer waits after emitting.
    pub cost: Duration,
}

/// Errors that terminate a sequencer run as `failed`.
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    /// Delivery failed after bounded retries.
    #[error("emission failed: {source}")]
    Emit {
        /// The underlying publish error.
        #[from]
        source: PublishError,
    },

    /// The state machine attempted an illegal transition.
    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition {
        /// Phase before the transition.
        from: Phase,
        /// Requested phase.
        to: Phase,
    },
}

impl SequencerError {
    /// Whether this error is a cancellation surfacing from a retry pause.
    const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Emit {
                source: PublishError::Cancelled
            }
        )
    }
}

/// How a run ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerOutcome {
    /// Reached `ended` through its bounds.
    Completed {
        /// Total data units emitted.
        units: u64,
    },
    /// Cancelled at a checkpoint before `ended`.
    Stopped {
        /// Data units emitted before the stop.
        units: u64,
    },
}

/// Receives every step of a sequencer run.
#[async_trait]
pub trait Emitter: Send {
    /// Deliver one event. The sequencer does not advance until this returns.
    async fn emit(&mut self, event: SequencerEvent) -> Result<(), SequencerError>;

    /// Observe a phase transition.
    fn on_phase(&mut self, _phase: Phase) {}

    /// Observe logical time after each completed wait.
    fn on_tick(&mut self, _tick: Duration) {}
}

/// Internal control flow: keep going or unwind.
enum Flow {
    Continue,
    Stop,
}

/// How a physics period ended.
enum PeriodEnd {
    /// The period duration elapsed.
    DurationElapsed,
    /// The unit budget is spent.
    BudgetExhausted,
    /// The total duration bound was reached.
    BoundReached,
}

/// One run of the phase state machine.
pub struct PhaseSequencer<'a> {
    params: &'a ParameterSet,
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
    phase: Phase,
    units: u64,
}

impl<'a> PhaseSequencer<'a> {
    /// Prepare a run in phase `idle`.
    pub const fn new(
        params: &'a ParameterSet,
        clock: &'a dyn Clock,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            params,
            clock,
            cancel,
            phase: Phase::Idle,
            units: 0,
        }
    }

    /// Drive the state machine to completion, cancellation, or fault.
    ///
    /// A publish cancelled during a retry pause counts as a stop.
    pub async fn run<E>(mut self, emitter: &mut E) -> Result<SequencerOutcome, SequencerError>
    where
        E: Emitter + ?Sized,
    {
        match self.drive(emitter).await {
            Ok(Flow::Continue) => Ok(SequencerOutcome::Completed { units: self.units }),
            Ok(Flow::Stop) => Ok(SequencerOutcome::Stopped { units: self.units }),
            Err(e) if e.is_cancellation() => Ok(SequencerOutcome::Stopped { units: self.units }),
            Err(e) => Err(e),
        }
    }

    async fn drive<E>(&mut self, emitter: &mut E) -> Result<Flow, SequencerError>
    where
        E: Emitter + ?Sized,
    {
        emitter.on_phase(Phase::Idle);
        let p = self.params;

        // idle -> imminent
        if let Flow::Stop = self.pause(emitter, p.pre_run_delay).await {
            return Ok(Flow::Stop);
        }
        if let Flow::Stop = self.notify(emitter, NotificationKind::Imminent).await? {
            return Ok(Flow::Stop);
        }
        if let Flow::Stop = self.pause(emitter, p.broadcast_delay).await {
            return Ok(Flow::Stop);
        }
        if let Flow::Stop = self.pause(emitter, p.setup_delay).await {
            return Ok(Flow::Stop);
        }

        // imminent -> ready
        self.enter(emitter, Phase::Ready)?;
        if let Flow::Stop = self.pause(emitter, p.ready_delay).await {
            return Ok(Flow::Stop);
        }

        // physics periods
        let mut period: u32 = 0;
        loop {
            // Later periods only start once the standby gap is known to end
            // short of the bound, so a standby always leads back to physics.
            if period == 0 && self.duration_bound_reached() {
                break;
            }
            period = period.saturating_add(1);
            let kind = if period == 1 {
                NotificationKind::Start
            } else {
                NotificationKind::Resume
            };
            if let Flow::Stop = self.notify(emitter, kind).await? {
                return Ok(Flow::Stop);
            }
            if let Flow::Stop = self.pause(emitter, p.broadcast_delay).await {
                return Ok(Flow::Stop);
            }

            let last_period = p.period_count != 0 && period >= p.period_count;
            let open_ended = p.unit_bound().is_some() && (p.period_count == 0 || last_period);
            let end = match self.generate(emitter, open_ended).await? {
                Some(end) => end,
                None => return Ok(Flow::Stop),
            };
            debug!(period, units = self.units, "Physics period finished");

            match end {
                PeriodEnd::BudgetExhausted | PeriodEnd::BoundReached => break,
                PeriodEnd::DurationElapsed if last_period || self.standby_reaches_bound() => {
                    break;
                }
                PeriodEnd::DurationElapsed => {}
            }

            // physics -> standby
            if let Flow::Stop = self.notify(emitter, NotificationKind::Pause).await? {
                return Ok(Flow::Stop);
            }
            if let Flow::Stop = self.pause(emitter, p.broadcast_delay).await {
                return Ok(Flow::Stop);
            }
            if let Flow::Stop = self.pause(emitter, p.standby_duration).await {
                return Ok(Flow::Stop);
            }
        }

        // -> ended
        if let Flow::Stop = self.notify(emitter, NotificationKind::End).await? {
            return Ok(Flow::Stop);
        }
        // Cooldown: the run has ended, a stop here changes nothing.
        let _ = self.pause(emitter, p.broadcast_delay).await;
        let _ = self.pause(emitter, p.post_run_delay).await;
        Ok(Flow::Continue)
    }

    /// Emit data units for one physics period.
    ///
    /// Returns `None` if cancellation was observed.
    async fn generate<E>(
        &mut self,
        emitter: &mut E,
        open_ended: bool,
    ) -> Result<Option<PeriodEnd>, SequencerError>
    where
        E: Emitter + ?Sized,
    {
        let p = self.params;
        let period_start = self.clock.now();
        let period_over =
            |clock: &dyn Clock| clock.now().saturating_sub(period_start) >= p.period_duration;

        loop {
            if self.budget_exhausted() {
                return Ok(Some(PeriodEnd::BudgetExhausted));
            }
            if !open_ended && period_over(self.clock) {
                return Ok(Some(PeriodEnd::DurationElapsed));
            }
            if self.duration_bound_reached() {
                return Ok(Some(PeriodEnd::BoundReached));
            }
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let unit = DataUnit {
                sequence: self.units.saturating_add(1),
                tick: self.clock.now(),
                cost: p.unit_cost,
            };
            emitter.emit(SequencerEvent::DataUnit(unit)).await?;
            self.units = unit.sequence;

            if let Flow::Stop = self.pause(emitter, p.unit_cost).await {
                return Ok(None);
            }
            if self.budget_exhausted() {
                return Ok(Some(PeriodEnd::BudgetExhausted));
            }
            if !open_ended && period_over(self.clock) {
                return Ok(Some(PeriodEnd::DurationElapsed));
            }
            if let Flow::Stop = self.pause(emitter, p.unit_interval).await {
                return Ok(None);
            }
        }
    }

    /// Checkpoint, then emit a notification and enter its phase.
    async fn notify<E>(
        &mut self,
        emitter: &mut E,
        kind: NotificationKind,
    ) -> Result<Flow, SequencerError>
    where
        E: Emitter + ?Sized,
    {
        if self.cancel.is_cancelled() {
            return Ok(Flow::Stop);
        }
        let target = kind.phase();
        if !self.phase.can_transition_to(target) {
            return Err(SequencerError::IllegalTransition {
                from: self.phase,
                to: target,
            });
        }
        emitter
            .emit(SequencerEvent::Notification {
                kind,
                tick: self.clock.now(),
                units_so_far: self.units,
            })
            .await?;
        self.enter(emitter, target)?;
        Ok(Flow::Continue)
    }

    /// Checkpoint, then wait.
    async fn pause<E>(&self, emitter: &mut E, duration: Duration) -> Flow
    where
        E: Emitter + ?Sized,
    {
        if self.cancel.is_cancelled() {
            return Flow::Stop;
        }
        let outcome = self.clock.wait(duration, self.cancel).await;
        emitter.on_tick(self.clock.now());
        match outcome {
            WaitOutcome::Elapsed => Flow::Continue,
            WaitOutcome::Cancelled => Flow::Stop,
        }
    }

    fn enter<E>(&mut self, emitter: &mut E, next: Phase) -> Result<(), SequencerError>
    where
        E: Emitter + ?Sized,
    {
        if !self.phase.can_transition_to(next) {
            return Err(SequencerError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!(from = %self.phase, to = %next, tick = self.clock.now().as_secs_f64(), "Phase transition");
        self.phase = next;
        emitter.on_phase(next);
        Ok(())
    }

    fn budget_exhausted(&self) -> bool {
        self.params
            .unit_bound()
            .is_some_and(|bound| self.units >= bound)
    }

    fn duration_bound_reached(&self) -> bool {
        self.params
            .duration_bound()
            .is_some_and(|bound| self.clock.now() >= bound)
    }

    /// Whether the pause notification and standby after a period would
    /// run into the duration bound.
    fn standby_reaches_bound(&self) -> bool {
        let p = self.params;
        p.duration_bound().is_some_and(|bound| {
            self.clock
                .now()
                .saturating_add(p.broadcast_delay)
                .saturating_add(p.standby_duration)
                >= bound
        })
    }
}
