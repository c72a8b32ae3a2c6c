//! Configuration loading and typed config structures for the DAQflow engine.
//!
//! The canonical configuration lives in `daqflow-config.yaml` next to the
//! engine (the path can be overridden with `DAQFLOW_CONFIG`). This module
//! defines strongly-typed structs that mirror the YAML structure and a
//! loader that reads and validates the file. A missing file means defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use daqflow_types::{Destination, DestinationError};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::publisher::RetryPolicy;
use crate::supervisor::SupervisorSettings;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "daqflow-config.yaml";

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "DAQFLOW_CONFIG";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A destination reference is malformed.
    #[error("invalid destination `{field}`: {source}")]
    Destination {
        /// Which entry of `destinations` is wrong.
        field: &'static str,
        /// The underlying parse error.
        source: DestinationError,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
///
/// Mirrors the structure of `daqflow-config.yaml`. Every field has a
/// default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Identity and registry settings.
    #[serde(default)]
    pub engine: EngineSection,

    /// Heartbeat loop settings.
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Delivery retry settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Bus destinations.
    #[serde(default)]
    pub destinations: DestinationsConfig,

    /// Infrastructure connection settings.
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named parameter profiles, used as defaults for run requests.
    #[serde(default)]
    pub workflows: BTreeMap<String, Map<String, Value>>,
}

impl EngineConfig {
    /// Load configuration from `path`, or defaults if the file is absent.
    ///
    /// Environment overrides are applied in both cases.
    ///
    /// # Errors
    ///
    /// See [`from_file`](Self::from_file).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::from_file(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `NATS_URL` overrides `infrastructure.nats_url`
    /// - `DAQFLOW_NAMESPACE` overrides `engine.namespace`
    /// - `SWF_MONITOR_URL` overrides `infrastructure.monitor_url`
    /// - `DAQFLOW_OBSERVER_PORT` overrides `infrastructure.observer_port`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Destination`] if a destination is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse_raw(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Destination`] if a destination is malformed.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_raw(yaml)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse_raw(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as null, not as an empty mapping.
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        let _ = config.destinations.resolve()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("NATS_URL") {
            self.infrastructure.nats_url = val;
        }
        if let Some(val) = lookup("DAQFLOW_NAMESPACE") {
            self.engine.namespace = Some(val).filter(|ns| !ns.is_empty());
        }
        if let Some(val) = lookup("SWF_MONITOR_URL") {
            self.infrastructure.monitor_url = Some(val).filter(|url| !url.is_empty());
        }
        if let Some(val) = lookup("DAQFLOW_OBSERVER_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.infrastructure.observer_port = port,
                Err(e) => warn!(value = val, error = %e, "Ignoring invalid DAQFLOW_OBSERVER_PORT"),
            }
        }
        if self.engine.operator.is_none() {
            self.engine.operator = lookup("USER").filter(|user| !user.is_empty());
        }
    }

    /// Operator identity used when a run request names none.
    pub fn default_operator(&self) -> String {
        self.engine
            .operator
            .clone()
            .unwrap_or_else(|| "unknown".to_owned())
    }

    /// Settings for the execution supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Destination`] if a destination is malformed.
    pub fn supervisor_settings(&self) -> Result<SupervisorSettings, ConfigError> {
        let destinations = self.destinations.resolve()?;
        Ok(SupervisorSettings {
            namespace: self.engine.namespace.clone(),
            events: destinations.events,
            status: destinations.status,
            retry: self.transport.retry_policy(),
            run_number_start: self.engine.run_number_start,
            retain_finished: self.engine.retain_finished,
        })
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Engine identity and registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineSection {
    /// Name reported in heartbeats.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// Testbed namespace. Requests for another namespace are rejected.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Default operator identity.
    #[serde(default)]
    pub operator: Option<String>,

    /// First run number to allocate.
    #[serde(default = "default_run_number_start")]
    pub run_number_start: u64,

    /// Finished executions kept for status queries.
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,

    /// How long shutdown waits for executions to report.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Pacing used when a run request does not say.
    #[serde(default = "default_true")]
    pub default_realtime: bool,
}

impl EngineSection {
    /// Shutdown grace period.
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            namespace: None,
            operator: None,
            run_number_start: default_run_number_start(),
            retain_finished: default_retain_finished(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            default_realtime: true,
        }
    }
}

/// Heartbeat loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LivenessConfig {
    /// Milliseconds between beats.
    #[serde(default = "default_liveness_interval_ms")]
    pub interval_ms: u64,

    /// Upper bound on one sink call, in milliseconds.
    #[serde(default = "default_sink_timeout_ms")]
    pub sink_timeout_ms: u64,
}

impl LivenessConfig {
    /// Interval between beats, never zero.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Sink call bound.
    pub const fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_liveness_interval_ms(),
            sink_timeout_ms: default_sink_timeout_ms(),
        }
    }
}

/// Delivery retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportConfig {
    /// Attempts per emission, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl TransportConfig {
    /// Retry policy built from these settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Bus destination references, each with its discipline prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DestinationsConfig {
    /// Run notifications and data units.
    #[serde(default = "default_events_destination")]
    pub events: String,

    /// Inbound control requests.
    #[serde(default = "default_control_destination")]
    pub control: String,

    /// Terminal status reports.
    #[serde(default = "default_status_destination")]
    pub status: String,

    /// Heartbeats.
    #[serde(default = "default_heartbeat_destination")]
    pub heartbeat: String,
}

/// Parsed bus destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    /// Run notifications and data units.
    pub events: Destination,
    /// Inbound control requests.
    pub control: Destination,
    /// Terminal status reports.
    pub status: Destination,
    /// Heartbeats.
    pub heartbeat: Destination,
}

impl DestinationsConfig {
    /// Parse every reference.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Destination`] naming the first bad entry.
    pub fn resolve(&self) -> Result<Destinations, ConfigError> {
        let parse = |field: &'static str, reference: &str| {
            Destination::parse(reference).map_err(|source| ConfigError::Destination { field, source })
        };
        Ok(Destinations {
            events: parse("events", &self.events)?,
            control: parse("control", &self.control)?,
            status: parse("status", &self.status)?,
            heartbeat: parse("heartbeat", &self.heartbeat)?,
        })
    }
}

impl Default for DestinationsConfig {
    fn default() -> Self {
        Self {
            events: default_events_destination(),
            control: default_control_destination(),
            status: default_status_destination(),
            heartbeat: default_heartbeat_destination(),
        }
    }
}

/// Infrastructure connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfrastructureConfig {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// HTTP port for the status API.
    #[serde(default = "default_observer_port")]
    pub observer_port: u16,

    /// Base URL of the external monitor receiving heartbeats.
    #[serde(default)]
    pub monitor_url: Option<String>,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            observer_port: default_observer_port(),
            monitor_url: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions for serde
// ---------------------------------------------------------------------------

fn default_agent_name() -> String {
    "daqflow-engine".to_owned()
}

const fn default_run_number_start() -> u64 {
    1
}

const fn default_retain_finished() -> usize {
    64
}

const fn default_shutdown_grace_ms() -> u64 {
    5000
}

const fn default_liveness_interval_ms() -> u64 {
    30_000
}

const fn default_sink_timeout_ms() -> u64 {
    5000
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_events_destination() -> String {
    "/topic/epictopic".to_owned()
}

fn default_control_destination() -> String {
    "/queue/workflow_control".to_owned()
}

fn default_status_destination() -> String {
    "/queue/workflow_status".to_owned()
}

fn default_heartbeat_destination() -> String {
    "/topic/daqflow.heartbeat".to_owned()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_owned()
}

const fn default_observer_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}
