//! Running the status server next to the engine's other tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::server::{self, ServerConfig, ServerError};
use crate::state::AppState;

/// A status server running on a background task.
pub struct ObserverHandle {
    /// Address actually bound.
    pub local_addr: SocketAddr,
    /// Completes once the server has stopped.
    pub task: JoinHandle<()>,
}

/// Bind the status server on `port` and serve it on a background task.
///
/// Binding happens before this returns, so a taken port fails startup
/// instead of surfacing later in the logs. The server stops when
/// `shutdown` is cancelled.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the port cannot be bound.
pub async fn spawn_observer(
    port: u16,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<ObserverHandle, ServerError> {
    let config = ServerConfig::on_port(port);
    let listener = server::bind(config).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Bind {
            addr: config.socket_addr(),
            source,
        })?;

    let task = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, state, shutdown).await {
            error!(error = %e, "Status server exited with error");
        }
    });

    Ok(ObserverHandle { local_addr, task })
}
