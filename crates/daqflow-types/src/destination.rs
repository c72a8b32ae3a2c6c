//! Message bus destinations with an explicit delivery discipline.
//!
//! A destination reference is written `/topic/<name>` for broadcast or
//! `/queue/<name>` for point-to-point delivery. A bare name is rejected:
//! the engine never guesses which discipline a destination uses.

use serde::{Deserialize, Serialize};

use crate::enums::Discipline;

/// Errors produced when parsing a destination reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    /// The reference does not start with `/topic/` or `/queue/`.
    #[error("destination {reference:?} does not declare a discipline (use /topic/<name> or /queue/<name>)")]
    MissingDiscipline {
        /// The offending reference.
        reference: String,
    },

    /// The name part is empty or contains characters a bus subject cannot carry.
    #[error("destination {reference:?} has an invalid name: {reason}")]
    InvalidName {
        /// The offending reference.
        reference: String,
        /// What is wrong with the name.
        reason: String,
    },
}

/// A named bus destination together with its delivery discipline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination {
    discipline: Discipline,
    name: String,
}

impl Destination {
    /// Parse a `/topic/<name>` or `/queue/<name>` reference.
    ///
    /// # Errors
    ///
    /// Returns [`DestinationError::MissingDiscipline`] for a reference
    /// without a discipline prefix, and [`DestinationError::InvalidName`]
    /// when the name is empty or malformed.
    pub fn parse(reference: &str) -> Result<Self, DestinationError> {
        let (discipline, name) = if let Some(name) = reference.strip_prefix("/topic/") {
            (Discipline::Broadcast, name)
        } else if let Some(name) = reference.strip_prefix("/queue/") {
            (Discipline::PointToPoint, name)
        } else {
            return Err(DestinationError::MissingDiscipline {
                reference: reference.to_owned(),
            });
        };
        validate_name(reference, name)?;
        Ok(Self {
            discipline,
            name: name.to_owned(),
        })
    }

    /// Build a broadcast destination from a bare name.
    ///
    /// # Errors
    ///
    /// Returns [`DestinationError::InvalidName`] when the name is malformed.
    pub fn broadcast(name: &str) -> Result<Self, DestinationError> {
        Self::parse(&format!("/topic/{name}"))
    }

    /// Build a point-to-point destination from a bare name.
    ///
    /// # Errors
    ///
    /// Returns [`DestinationError::InvalidName`] when the name is malformed.
    pub fn point_to_point(name: &str) -> Result<Self, DestinationError> {
        Self::parse(&format!("/queue/{name}"))
    }

    /// Delivery discipline of this destination.
    pub const fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Bare destination name, without the discipline prefix.
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn validate_name(reference: &str, name: &str) -> Result<(), DestinationError> {
    let invalid = |reason: &str| DestinationError::InvalidName {
        reference: reference.to_owned(),
        reason: reason.to_owned(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err(invalid("empty subject token"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid("only [A-Za-z0-9_.-] are allowed"));
    }
    Ok(())
}

impl core::fmt::Display for Destination {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.discipline.prefix(), self.name)
    }
}

impl core::str::FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Destination {
    type Error = DestinationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Destination> for String {
    fn from(dest: Destination) -> Self {
        dest.to_string()
    }
}
