//! Engine runtime: supervisor, control listener and liveness loop.
//!
//! The [`Runtime`] owns the root cancellation token. The control listener
//! and the liveness loop are separate tasks that share nothing blocking:
//! the listener only touches the supervisor registry through short lock
//! sections, and the liveness loop only reads counters and bounds every
//! sink call with a timeout. If the listener ever exits on its own the
//! runtime logs an error and every following heartbeat reports
//! [`LivenessStatus::Warning`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use daqflow_types::{BusMessage, Destination, Heartbeat, LivenessStatus};
use futures::{FutureExt as _, Stream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, Destinations, EngineConfig};
use crate::control::{ControlDispatcher, InboundControl, ListenerExit, run_listener};
use crate::publisher::{EventPublisher, PublishError};
use crate::supervisor::ExecutionSupervisor;

/// Receives every heartbeat.
#[async_trait]
pub trait LivenessSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Deliver one heartbeat.
    async fn beat(&self, heartbeat: &Heartbeat) -> Result<(), PublishError>;
}

/// Publishes heartbeats on the bus.
pub struct BusHeartbeatSink {
    publisher: Arc<dyn EventPublisher>,
    destination: Destination,
}

impl BusHeartbeatSink {
    /// Create a sink publishing to `destination`.
    pub fn new(publisher: Arc<dyn EventPublisher>, destination: Destination) -> Self {
        Self {
            publisher,
            destination,
        }
    }
}

#[async_trait]
impl LivenessSink for BusHeartbeatSink {
    fn name(&self) -> &str {
        "bus"
    }

    async fn beat(&self, heartbeat: &Heartbeat) -> Result<(), PublishError> {
        self.publisher
            .publish(&self.destination, &BusMessage::Heartbeat(heartbeat.clone()))
            .await
    }
}

/// Latest heartbeat and listener health, shared with the HTTP API.
#[derive(Debug, Default)]
pub struct LivenessState {
    latest: Mutex<Option<Heartbeat>>,
    listener_alive: AtomicBool,
}

impl LivenessState {
    /// The most recent heartbeat, if any beat has happened.
    pub fn latest(&self) -> Option<Heartbeat> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the control listener task is running.
    pub fn listener_alive(&self) -> bool {
        self.listener_alive.load(Ordering::Acquire)
    }

    fn set_listener_alive(&self, alive: bool) {
        self.listener_alive.store(alive, Ordering::Release);
    }

    fn record(&self, heartbeat: Heartbeat) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(heartbeat);
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Composes the supervisor, the control dispatcher and the liveness loop.
pub struct Runtime {
    agent_name: String,
    namespace: Option<String>,
    interval: Duration,
    sink_timeout: Duration,
    shutdown_grace: Duration,
    destinations: Destinations,
    publisher: Arc<dyn EventPublisher>,
    root: CancellationToken,
    supervisor: ExecutionSupervisor,
    dispatcher: Arc<ControlDispatcher>,
    liveness: Arc<LivenessState>,
}

impl Runtime {
    /// Build a runtime publishing through `publisher`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Destination`] if a destination is malformed.
    pub fn new(config: &EngineConfig, publisher: Arc<dyn EventPublisher>) -> Result<Self, ConfigError> {
        let root = CancellationToken::new();
        let supervisor = ExecutionSupervisor::new(
            config.supervisor_settings()?,
            Arc::clone(&publisher),
            root.clone(),
        );
        let dispatcher = Arc::new(ControlDispatcher::new(supervisor.clone(), config));
        Ok(Self {
            agent_name: config.engine.agent_name.clone(),
            namespace: config.engine.namespace.clone(),
            interval: config.liveness.interval(),
            sink_timeout: config.liveness.sink_timeout(),
            shutdown_grace: config.engine.shutdown_grace(),
            destinations: config.destinations.resolve()?,
            publisher,
            root,
            supervisor,
            dispatcher,
            liveness: Arc::new(LivenessState::default()),
        })
    }

    /// The execution supervisor.
    pub const fn supervisor(&self) -> &ExecutionSupervisor {
        &self.supervisor
    }

    /// The control dispatcher shared by the bus listener and the HTTP API.
    pub fn dispatcher(&self) -> Arc<ControlDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Shared liveness state.
    pub fn liveness(&self) -> Arc<LivenessState> {
        Arc::clone(&self.liveness)
    }

    /// Parsed bus destinations.
    pub const fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    /// Token cancelled on shutdown.
    pub fn cancellation(&self) -> CancellationToken {
        self.root.clone()
    }

    /// A sink publishing heartbeats to the configured heartbeat destination.
    pub fn bus_heartbeat_sink(&self) -> Arc<dyn LivenessSink> {
        Arc::new(BusHeartbeatSink::new(
            Arc::clone(&self.publisher),
            self.destinations.heartbeat.clone(),
        ))
    }

    /// Run the control listener on its own task.
    pub fn spawn_listener<S>(&self, inbound: S) -> JoinHandle<()>
    where
        S: Stream<Item = InboundControl> + Unpin + Send + 'static,
    {
        let dispatcher = Arc::clone(&self.dispatcher);
        let liveness = Arc::clone(&self.liveness);
        let cancel = self.root.clone();
        liveness.set_listener_alive(true);

        tokio::spawn(async move {
            let exit = AssertUnwindSafe(run_listener(dispatcher, inbound, cancel))
                .catch_unwind()
                .await;
            liveness.set_listener_alive(false);
            match exit {
                Ok(ListenerExit::Shutdown) => info!("Control listener stopped"),
                Ok(ListenerExit::StreamEnded) => {
                    error!("Control subscription ended unexpectedly; no further commands will be received");
                }
                Err(_) => error!("Control listener panicked; no further commands will be received"),
            }
        })
    }

    /// Run the liveness loop on its own task.
    ///
    /// The first beat happens immediately.
    pub fn spawn_liveness(&self, sinks: Vec<Arc<dyn LivenessSink>>) -> JoinHandle<()> {
        let beat = BeatContext {
            agent_name: self.agent_name.clone(),
            namespace: self.namespace.clone(),
            sink_timeout: self.sink_timeout,
            supervisor: self.supervisor.clone(),
            liveness: Arc::clone(&self.liveness),
            sinks,
        };
        let interval = self.interval;
        let cancel = self.root.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sequence: u64 = 0;
            info!(
                interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                sinks = beat.sinks.len(),
                "Liveness loop started"
            );
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                sequence = sequence.saturating_add(1);
                beat.run(sequence).await;
            }
            info!("Liveness loop stopped");
        })
    }

    /// Cancel everything and wait up to the grace period for executions to
    /// report. Returns `true` if all executions retired in time.
    pub async fn shutdown(&self) -> bool {
        info!(
            running = self.supervisor.running_count(),
            grace_ms = u64::try_from(self.shutdown_grace.as_millis()).unwrap_or(u64::MAX),
            "Shutting down runtime"
        );
        self.root.cancel();
        self.supervisor.shutdown(self.shutdown_grace).await
    }
}

/// Everything one heartbeat needs.
struct BeatContext {
    agent_name: String,
    namespace: Option<String>,
    sink_timeout: Duration,
    supervisor: ExecutionSupervisor,
    liveness: Arc<LivenessState>,
    sinks: Vec<Arc<dyn LivenessSink>>,
}

impl BeatContext {
    async fn run(&self, sequence: u64) {
        let listener_alive = self.liveness.listener_alive();
        let heartbeat = Heartbeat {
            agent_name: self.agent_name.clone(),
            namespace: self.namespace.clone(),
            status: if listener_alive {
                LivenessStatus::Ok
            } else {
                LivenessStatus::Warning
            },
            listener_alive,
            running_executions: u64::try_from(self.supervisor.running_count()).unwrap_or(u64::MAX),
            sequence,
            timestamp: Utc::now(),
        };
        self.liveness.record(heartbeat.clone());
        debug!(
            sequence,
            listener_alive,
            running_executions = heartbeat.running_executions,
            "Heartbeat"
        );

        let deliveries = self.sinks.iter().map(|sink| {
            let heartbeat = &heartbeat;
            async move {
                match tokio::time::timeout(self.sink_timeout, sink.beat(heartbeat)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(sink = sink.name(), error = %e, "Heartbeat delivery failed"),
                    Err(_) => warn!(
                        sink = sink.name(),
                        timeout_ms = u64::try_from(self.sink_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Heartbeat delivery timed out"
                    ),
                }
            }
        });
        let _ = futures::future::join_all(deliveries).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::channel::mpsc;

    use super::*;
    use crate::publisher::RecordingPublisher;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.apply_overrides_from(|_| None);
        config.engine.namespace = Some("testbed".to_owned());
        config.liveness.interval_ms = 1000;
        config.liveness.sink_timeout_ms = 100;
        config
    }

    fn runtime() -> (Runtime, Arc<RecordingPublisher>) {
        let recorder = Arc::new(RecordingPublisher::new());
        let runtime = Runtime::new(&config(), Arc::clone(&recorder) as Arc<dyn EventPublisher>).unwrap();
        (runtime, recorder)
    }

    /// A sink whose delivery never completes.
    struct HungSink;

    #[async_trait]
    impl LivenessSink for HungSink {
        fn name(&self) -> &str {
            "hung"
        }

        async fn beat(&self, _heartbeat: &Heartbeat) -> Result<(), PublishError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn heartbeats(recorder: &RecordingPublisher) -> Vec<Heartbeat> {
        recorder
            .records()
            .into_iter()
            .filter_map(|(dest, message)| match message {
                BusMessage::Heartbeat(hb) => {
                    assert_eq!(dest.to_string(), "/topic/daqflow.heartbeat");
                    Some(hb)
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn first_beat_is_immediate() {
        let (runtime, recorder) = runtime();
        assert!(runtime.liveness().latest().is_none());

        let handle = runtime.spawn_liveness(vec![runtime.bus_heartbeat_sink()]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let latest = runtime.liveness().latest().unwrap();
        assert_eq!(latest.sequence, 1);
        assert_eq!(latest.agent_name, "daqflow-engine");
        assert_eq!(latest.namespace.as_deref(), Some("testbed"));
        assert_eq!(heartbeats(&recorder).len(), 1);

        assert!(runtime.shutdown().await);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sink_does_not_stall_beats() {
        let (runtime, recorder) = runtime();
        let handle = runtime.spawn_liveness(vec![
            Arc::new(HungSink) as Arc<dyn LivenessSink>,
            runtime.bus_heartbeat_sink(),
        ]);

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let beats = heartbeats(&recorder);
        assert!(beats.len() >= 3, "only {} beats delivered", beats.len());
        let sequences: Vec<u64> = beats.iter().map(|hb| hb.sequence).collect();
        assert!(sequences.windows(2).all(|w| w.first() < w.get(1)));

        assert!(runtime.shutdown().await);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dead_listener_turns_heartbeat_to_warning() {
        let (runtime, _) = runtime();
        let (tx, rx) = mpsc::unbounded::<InboundControl>();

        let listener = runtime.spawn_listener(rx);
        assert!(runtime.liveness().listener_alive());
        drop(tx);
        listener.await.unwrap();
        assert!(!runtime.liveness().listener_alive());

        let handle = runtime.spawn_liveness(Vec::new());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let latest = runtime.liveness().latest().unwrap();
        assert_eq!(latest.status, LivenessStatus::Warning);
        assert!(!latest.listener_alive);

        assert!(runtime.shutdown().await);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_listener_reports_ok_while_execution_runs() {
        let (runtime, _) = runtime();
        let (tx, rx) = mpsc::unbounded::<InboundControl>();
        let listener = runtime.spawn_listener(rx);
        let handle = runtime.spawn_liveness(Vec::new());

        let started = runtime.dispatcher().handle_bytes(
            br#"{"msg_type":"run_workflow","realtime":true,"params":{"physics_period_count":1,"physics_period_duration":3600,"stf_interval":10}}"#,
        );
        assert!(started.is_success());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let latest = runtime.liveness().latest().unwrap();
        assert_eq!(latest.status, LivenessStatus::Ok);
        assert_eq!(latest.running_executions, 1);
        assert!(latest.sequence >= 3);

        assert!(runtime.shutdown().await);
        listener.await.unwrap();
        handle.await.unwrap();
        drop(tx);
    }
}
