//! Heartbeat sink for the external testbed monitor.
//!
//! Each beat is POSTed as JSON to `{monitor_url}/api/systemagents/heartbeat/`.
//! A failed beat is logged by the liveness loop and retried on the next
//! interval.

use std::time::Duration;

use async_trait::async_trait;
use daqflow_core::publisher::PublishError;
use daqflow_core::runtime::LivenessSink;
use daqflow_types::{Heartbeat, LivenessStatus};
use serde::Serialize;

use crate::error::EngineError;

/// Agent type the monitor files this engine under.
pub const AGENT_TYPE: &str = "workflow_runner";

/// Body of one monitor heartbeat.
#[derive(Debug, Serialize)]
pub struct MonitorHeartbeat<'a> {
    /// Engine instance name.
    pub instance_name: &'a str,
    /// Agent category.
    pub agent_type: &'static str,
    /// `OK` or `WARNING`.
    pub status: LivenessStatus,
    /// Human-readable summary.
    pub description: String,
    /// Whether the control listener is connected.
    pub mq_connected: bool,
    /// Engine namespace, if configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<&'a str>,
}

impl<'a> MonitorHeartbeat<'a> {
    /// Build the monitor payload for a heartbeat.
    pub fn from_heartbeat(heartbeat: &'a Heartbeat) -> Self {
        Self {
            instance_name: &heartbeat.agent_name,
            agent_type: AGENT_TYPE,
            status: heartbeat.status,
            description: format!(
                "DAQflow workflow engine. Running executions: {}. Control: {}",
                heartbeat.running_executions,
                if heartbeat.listener_alive {
                    "listening"
                } else {
                    "down"
                },
            ),
            mq_connected: heartbeat.listener_alive,
            namespace: heartbeat.namespace.as_deref(),
        }
    }
}

/// Sends heartbeats to the monitor over HTTP.
pub struct MonitorHeartbeatSink {
    client: reqwest::Client,
    url: String,
}

impl MonitorHeartbeatSink {
    /// Build a sink for the monitor at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Monitor`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Monitor {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            url: heartbeat_url(base_url),
        })
    }

    /// The endpoint beats are sent to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Heartbeat endpoint under a monitor base URL.
pub fn heartbeat_url(base_url: &str) -> String {
    format!("{}/api/systemagents/heartbeat/", base_url.trim_end_matches('/'))
}

#[async_trait]
impl LivenessSink for MonitorHeartbeatSink {
    fn name(&self) -> &str {
        "monitor"
    }

    async fn beat(&self, heartbeat: &Heartbeat) -> Result<(), PublishError> {
        let body = MonitorHeartbeat::from_heartbeat(heartbeat);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transport {
                message: format!("monitor request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Transport {
                message: format!("monitor returned HTTP {status}"),
            });
        }
        Ok(())
    }
}
