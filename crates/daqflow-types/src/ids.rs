//! Identifier newtypes for executions and DAQ runs.
//!
//! An [`ExecutionId`] is human-readable on purpose: operators type it into
//! stop and status commands. It is composed of the workflow kind, the
//! operator identity, and a per-workflow sequence number, for example
//! `stf_datataking-alice-0007`.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Unique, human-readable identifier of one workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export, export_to = "bindings/")]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Compose an identifier from its three parts.
    ///
    /// Characters outside `[A-Za-z0-9_.]` in the operator identity are
    /// replaced with `_` so the id stays a single shell word and a valid
    /// bus subject token.
    pub fn compose(workflow: &str, operator: &str, sequence: u32) -> Self {
        let operator: String = operator
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let operator = if operator.is_empty() {
            String::from("unknown")
        } else {
            operator
        };
        Self(format!("{workflow}-{operator}-{sequence:04}"))
    }

    /// Return the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// DAQ run number allocated to an execution when it starts.
///
/// Run numbers increase monotonically across all executions of one engine
/// process and appear in every message and data-unit filename of the run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export, export_to = "bindings/")]
pub struct RunNumber(pub u64);

impl RunNumber {
    /// Return the inner numeric value.
    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for RunNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}
