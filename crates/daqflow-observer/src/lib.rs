//! Status API server for the DAQflow engine.
//!
//! An Axum application exposing:
//!
//! - **REST endpoints** for listing, starting and stopping executions
//! - **`WebSocket` endpoint** (`/ws/events`) streaming every bus message
//!   the engine emits, optionally for a single execution
//! - **Health endpoint** (`/health`) with the latest heartbeat
//! - **HTML page** (`GET /`) with liveness and execution counts
//!
//! Commands and queries go through the engine's control dispatcher, the
//! same one the bus listener uses, so both entry points answer alike.

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod startup;
pub mod state;
pub mod ws;

pub use router::build_router;
pub use server::{ServerConfig, ServerError};
pub use startup::{ObserverHandle, spawn_observer};
pub use state::AppState;
