//! DAQflow engine binary.
//!
//! Wires the execution runtime to NATS: control requests arrive on the
//! control destination, run notifications and data units go out on the
//! events destination, and a liveness loop reports health to the bus and
//! optionally to the testbed monitor. The status API runs alongside.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `$DAQFLOW_CONFIG` or `daqflow-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Connect to NATS
//! 4. Build the runtime
//! 5. Subscribe to control requests and spawn the listener
//! 6. Spawn the liveness loop
//! 7. Start the status API server
//! 8. Wait for Ctrl-C, then shut down

mod error;
mod monitor;
mod nats;

use std::path::PathBuf;
use std::sync::Arc;

use daqflow_core::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE, EngineConfig, LogFormat, LoggingConfig};
use daqflow_core::publisher::{ChannelPublisher, FanoutPublisher};
use daqflow_core::runtime::{LivenessSink, Runtime};
use daqflow_observer::startup::spawn_observer;
use daqflow_observer::state::AppState;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::monitor::MonitorHeartbeatSink;
use crate::nats::NatsPublisher;

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if any startup step fails. Failures after startup are
/// logged and end in an orderly shutdown.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config_path = config_path();
    let config = EngineConfig::load(&config_path).map_err(EngineError::from)?;

    // 2. Initialize structured logging.
    init_logging(&config.logging)?;
    info!(
        path = %config_path.display(),
        agent_name = config.engine.agent_name,
        namespace = config.engine.namespace.as_deref().unwrap_or("-"),
        profiles = config.workflows.len(),
        "Configuration loaded"
    );

    // 3. Connect to NATS.
    let client = nats::connect(&config.infrastructure.nats_url).await?;

    // 4. Build the runtime. Every bus message is also tapped into the
    //    in-process channel feeding the status API's event stream.
    let events = ChannelPublisher::new();
    let publisher = FanoutPublisher::new(Arc::new(NatsPublisher::new(client.clone())))
        .with_tap(Arc::new(events.clone()));
    let runtime = Runtime::new(&config, Arc::new(publisher)).map_err(EngineError::from)?;
    info!(
        events = %runtime.destinations().events,
        status = %runtime.destinations().status,
        heartbeat = %runtime.destinations().heartbeat,
        "Runtime initialized"
    );

    // 5. Control listener.
    let subscriber = nats::subscribe_control(&client, &runtime.destinations().control).await?;
    let listener = runtime.spawn_listener(nats::control_stream(client.clone(), subscriber));

    // 6. Liveness loop.
    let mut sinks: Vec<Arc<dyn LivenessSink>> = vec![runtime.bus_heartbeat_sink()];
    if let Some(url) = config.infrastructure.monitor_url.as_deref() {
        let sink = MonitorHeartbeatSink::new(url, config.liveness.sink_timeout())?;
        info!(url = sink.url(), "Monitor heartbeats enabled");
        sinks.push(Arc::new(sink));
    }
    let liveness = runtime.spawn_liveness(sinks);

    // 7. Status API server. Stops when the runtime shuts down.
    let observer_port = config.infrastructure.observer_port;
    let state = Arc::new(AppState::from_runtime(&runtime, events));
    let observer = spawn_observer(observer_port, state, runtime.cancellation().child_token())
        .await
        .map_err(|e| EngineError::Observer {
            message: format!("{e}"),
        })?;
    info!(addr = %observer.local_addr, "Status API server started");

    info!("daqflow-engine ready");

    // 8. Wait for Ctrl-C, then shut down.
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C; shutting down");
    }
    info!("Shutdown requested");

    let clean = runtime.shutdown().await;
    join("control listener", listener).await;
    join("liveness loop", liveness).await;
    join("status server", observer.task).await;

    if let Err(e) = client.flush().await {
        warn!(error = %e, "Failed to flush NATS connection");
    }

    if clean {
        info!("daqflow-engine stopped");
    } else {
        warn!("daqflow-engine stopped before every execution reported");
    }
    Ok(())
}

/// Configuration file path: `$DAQFLOW_CONFIG` or the default file name.
fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV).map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) -> Result<(), EngineError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| EngineError::Logging {
        message: format!("{e}"),
    })
}

/// Await a background task, logging a panic or cancellation.
async fn join(task: &'static str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(task, error = %e, "Background task did not finish cleanly");
    }
}
