//! Clocks, phase sequencing and execution supervision for the DAQflow engine.
//!
//! This crate owns everything between a control request and the bus
//! messages an execution emits. It has no knowledge of the concrete bus;
//! the engine binary plugs one in through [`EventPublisher`].
//!
//! # Modules
//!
//! - [`clock`] -- [`Clock`] trait with accelerated and real-time pacing.
//! - [`config`] -- Configuration loading from `daqflow-config.yaml` into
//!   strongly-typed structs.
//! - [`control`] -- [`ControlDispatcher`] and the control channel listener.
//! - [`params`] -- Parameter validation into a [`ParameterSet`].
//! - [`progress`] -- Shared, lock-light progress of one execution.
//! - [`publisher`] -- [`EventPublisher`] seam, retries, in-process publishers.
//! - [`runtime`] -- [`Runtime`] composing listener, supervisor and liveness.
//! - [`sequencer`] -- The DAQ phase state machine.
//! - [`supervisor`] -- [`ExecutionSupervisor`] running executions on tasks.
//!
//! [`Clock`]: clock::Clock
//! [`ControlDispatcher`]: control::ControlDispatcher
//! [`EventPublisher`]: publisher::EventPublisher
//! [`ExecutionSupervisor`]: supervisor::ExecutionSupervisor
//! [`ParameterSet`]: params::ParameterSet
//! [`Runtime`]: runtime::Runtime

pub mod clock;
pub mod config;
pub mod control;
pub mod params;
pub mod progress;
pub mod publisher;
pub mod runtime;
pub mod sequencer;
pub mod supervisor;
