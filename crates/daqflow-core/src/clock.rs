//! Logical clocks that pace a phase sequencer.
//!
//! Every execution owns its own clock, so logical time starts at zero when
//! the execution starts. Two disciplines are provided:
//!
//! - [`AcceleratedClock`] advances logical time instantly. A bounded run
//!   completes in wall-clock time independent of its configured durations.
//! - [`RealTimeClock`] maps each logical wait onto the same wall-clock delay.
//!
//! # Design Principles
//!
//! - Logical time is the sum of completed waits, never a wall-clock
//!   reading. Under load a real-time execution falls behind its nominal
//!   schedule instead of shortening later waits to catch up.
//! - Every wait is cancellable and reports cancellation as a
//!   [`WaitOutcome`], never as an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of a [`Clock::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full duration elapsed.
    Elapsed,
    /// The cancellation token fired before or during the wait.
    Cancelled,
}

/// Source of logical time for one execution.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Logical time elapsed since the clock was created.
    fn now(&self) -> Duration;

    /// Suspend until `duration` of logical time has elapsed or `cancel` fires.
    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome;

    /// Whether waits are paced by the wall clock.
    fn is_realtime(&self) -> bool;

    /// How far wall-clock time has run ahead of logical time.
    fn lag(&self) -> Duration {
        Duration::ZERO
    }
}

/// Build the clock for an execution.
pub fn clock_for(realtime: bool) -> Box<dyn Clock> {
    if realtime {
        Box::new(RealTimeClock::new())
    } else {
        Box::new(AcceleratedClock::new())
    }
}

/// Saturating conversion to whole nanoseconds.
fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Accelerated
// ---------------------------------------------------------------------------

/// Clock whose waits return immediately after advancing logical time.
///
/// Each wait still yields to the scheduler once, so an accelerated
/// execution never monopolises a worker thread.
#[derive(Debug, Default)]
pub struct AcceleratedClock {
    /// Logical nanoseconds elapsed.
    elapsed_nanos: AtomicU64,
}

impl AcceleratedClock {
    /// Create a clock at logical time zero.
    pub const fn new() -> Self {
        Self {
            elapsed_nanos: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Clock for AcceleratedClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::Acquire))
    }

    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        let step = nanos(duration);
        // fetch_update never fails when the closure always returns Some.
        let _ = self
            .elapsed_nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(step))
            });
        tokio::task::yield_now().await;
        WaitOutcome::Elapsed
    }

    fn is_realtime(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Real time
// ---------------------------------------------------------------------------

/// Clock whose waits sleep for the same wall-clock duration.
///
/// Uses [`tokio::time`] so tests can run it under a paused runtime.
#[derive(Debug)]
pub struct RealTimeClock {
    /// Wall-clock instant the clock was created.
    origin: Instant,
    /// Logical nanoseconds elapsed.
    elapsed_nanos: AtomicU64,
}

impl RealTimeClock {
    /// Create a clock at logical time zero, anchored to the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_nanos: AtomicU64::new(0),
        }
    }

    fn advance(&self, duration: Duration) {
        let step = nanos(duration);
        let _ = self
            .elapsed_nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(step))
            });
    }
}

impl Default for RealTimeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for RealTimeClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::Acquire))
    }

    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        let started = Instant::now();
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.advance(started.elapsed().min(duration));
                WaitOutcome::Cancelled
            }
            () = tokio::time::sleep(duration) => {
                self.advance(duration);
                WaitOutcome::Elapsed
            }
        }
    }

    fn is_realtime(&self) -> bool {
        true
    }

    fn lag(&self) -> Duration {
        self.origin.elapsed().saturating_sub(self.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accelerated_wait_advances_without_delay() {
        let clock = AcceleratedClock::new();
        let cancel = CancellationToken::new();
        let wall = std::time::Instant::now();

        for _ in 0..1_000 {
            assert_eq!(
                clock.wait(Duration::from_secs(3_600), &cancel).await,
                WaitOutcome::Elapsed
            );
        }

        assert_eq!(clock.now(), Duration::from_secs(3_600_000));
        assert!(wall.elapsed() < Duration::from_secs(5));
        assert!(!clock.is_realtime());
    }

    #[tokio::test]
    async fn accelerated_wait_reports_cancellation_without_advancing() {
        let clock = AcceleratedClock::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            clock.wait(Duration::from_secs(10), &cancel).await,
            WaitOutcome::Cancelled
        );
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_wait_sleeps_for_logical_duration() {
        let clock = RealTimeClock::new();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        assert_eq!(
            clock.wait(Duration::from_secs(2), &cancel).await,
            WaitOutcome::Elapsed
        );
        assert_eq!(
            clock.wait(Duration::from_secs(3), &cancel).await,
            WaitOutcome::Elapsed
        );

        assert_eq!(clock.now(), Duration::from_secs(5));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(clock.is_realtime());
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_wait_is_cancellable_mid_sleep() {
        let clock = std::sync::Arc::new(RealTimeClock::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let clock = std::sync::Arc::clone(&clock);
            let cancel = cancel.clone();
            tokio::spawn(async move { clock.wait(Duration::from_secs(60), &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let outcome = waiter.await.ok();
        assert_eq!(outcome, Some(WaitOutcome::Cancelled));
        assert!(clock.now() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_does_not_catch_up_after_falling_behind() {
        let clock = RealTimeClock::new();
        let cancel = CancellationToken::new();

        // Something outside the clock stalls for 4s of wall time.
        tokio::time::sleep(Duration::from_secs(4)).await;
        let before = Instant::now();
        let _ = clock.wait(Duration::from_secs(2), &cancel).await;

        // The wait still takes its full duration.
        assert!(before.elapsed() >= Duration::from_secs(2));
        assert_eq!(clock.now(), Duration::from_secs(2));
        assert!(clock.lag() >= Duration::from_secs(4));
    }

    #[test]
    fn clock_for_selects_discipline() {
        assert!(clock_for(true).is_realtime());
        assert!(!clock_for(false).is_realtime());
    }
}
