//! Event publisher seam and bounded delivery retries.
//!
//! [`EventPublisher`] is the only way the engine talks to a message bus.
//! The engine binary provides a NATS implementation; this module provides
//! the in-process ones:
//!
//! - [`ChannelPublisher`] feeds a [`broadcast`] channel (live event stream).
//! - [`FanoutPublisher`] forwards to a primary publisher plus best-effort taps.
//! - [`RecordingPublisher`] keeps every message in memory, with optional
//!   injected transport failures.
//!
//! [`RetryPolicy`] wraps a single publish in a bounded number of attempts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use daqflow_types::{BusMessage, Destination};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors that can occur while publishing a message.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The message could not be encoded.
    #[error("failed to encode message: {source}")]
    Encode {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// The bus rejected the message or is unreachable.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Cancellation fired while waiting to retry.
    #[error("publish cancelled while retrying")]
    Cancelled,
}

impl PublishError {
    /// Whether another attempt may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Delivers bus messages to named destinations.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one message to one destination.
    async fn publish(&self, destination: &Destination, message: &BusMessage)
    -> Result<(), PublishError>;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    max_attempts: u32,
    /// Wall-clock pause between attempts.
    backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Total attempts, including the first.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Publish with retries.
    ///
    /// Only [`PublishError::Transport`] is retried. The pause between
    /// attempts ends early with [`PublishError::Cancelled`] if `cancel`
    /// fires.
    pub async fn publish(
        &self,
        publisher: &dyn EventPublisher,
        destination: &Destination,
        message: &BusMessage,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let mut attempt: u32 = 1;
        loop {
            match publisher.publish(destination, message).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        destination = %destination,
                        msg_type = message.msg_type(),
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(PublishError::Cancelled),
                        () = tokio::time::sleep(self.backoff) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

// ---------------------------------------------------------------------------
// In-process publishers
// ---------------------------------------------------------------------------

/// Capacity of a [`ChannelPublisher`] stream.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Publishes into a [`broadcast`] channel, ignoring the destination.
///
/// Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: broadcast::Sender<BusMessage>,
}

impl ChannelPublisher {
    /// Create a publisher with its own channel.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(
        &self,
        _destination: &Destination,
        message: &BusMessage,
    ) -> Result<(), PublishError> {
        let _ = self.tx.send(message.clone());
        Ok(())
    }
}

/// Forwards to a primary publisher, then to best-effort taps.
///
/// Only the primary's result is reported; tap failures are logged.
pub struct FanoutPublisher {
    primary: Arc<dyn EventPublisher>,
    taps: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    /// Create a fan-out around `primary`.
    pub fn new(primary: Arc<dyn EventPublisher>) -> Self {
        Self {
            primary,
            taps: Vec::new(),
        }
    }

    /// Add a best-effort tap.
    #[must_use]
    pub fn with_tap(mut self, tap: Arc<dyn EventPublisher>) -> Self {
        self.taps.push(tap);
        self
    }
}

#[async_trait]
impl EventPublisher for FanoutPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        message: &BusMessage,
    ) -> Result<(), PublishError> {
        self.primary.publish(destination, message).await?;
        for tap in &self.taps {
            if let Err(e) = tap.publish(destination, message).await {
                warn!(destination = %destination, error = %e, "Publish tap failed");
            }
        }
        Ok(())
    }
}

/// In-memory publisher that records every delivered message.
///
/// [`fail_next`](Self::fail_next) makes the next N publishes fail with a
/// transport error, to simulate an unreachable bus.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<(Destination, BusMessage)>>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl RecordingPublisher {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::Release);
    }

    /// Total publish calls, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Every delivered message, in delivery order.
    pub fn records(&self) -> Vec<(Destination, BusMessage)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delivered messages only.
    pub fn messages(&self) -> Vec<BusMessage> {
        self.records().into_iter().map(|(_, m)| m).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        message: &BusMessage,
    ) -> Result<(), PublishError> {
        let _ = self.attempts.fetch_add(1, Ordering::AcqRel);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PublishError::Transport {
                message: "injected failure".to_owned(),
            });
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((destination.clone(), message.clone()));
        Ok(())
    }
}
