//! Parameter sets for a DAQ run and their structural validation.
//!
//! A run request supplies a JSON object of parameters. Defaults come from
//! a named profile in the engine configuration; explicit overrides are
//! layered on top key by key ([`layer`]). The merged object is validated
//! once into a [`ParameterSet`], which the sequencer then treats as an
//! immutable value.
//!
//! All durations are logical seconds on the wire and [`Duration`] inside
//! the engine.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Errors raised while resolving or validating run parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    /// The parameter object is structurally malformed (missing key,
    /// wrong type, unknown key).
    #[error("malformed parameters: {message}")]
    Malformed {
        /// Parser description of the problem.
        message: String,
    },

    /// A parameter has a value outside its allowed range.
    #[error("invalid parameter `{key}`: {reason}")]
    Invalid {
        /// The offending key.
        key: &'static str,
        /// Why the value is rejected.
        reason: String,
    },

    /// Unbounded physics periods without an explicit opt-in.
    #[error(
        "physics_period_count is 0 with neither stf_count nor max_duration; \
         set allow_unbounded to run until stopped"
    )]
    Unbounded,

    /// The request names a parameter profile the engine does not know.
    #[error("unknown parameter profile `{name}`")]
    UnknownProfile {
        /// The requested profile name.
        name: String,
    },

    /// The workflow name is not a lowercase `[a-z0-9_]` label.
    #[error("invalid workflow name `{name}`")]
    InvalidWorkflowName {
        /// The requested workflow name.
        name: String,
    },
}

/// Wire form of the parameters: seconds as floating point.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParameters {
    #[serde(default)]
    no_beam_not_ready_delay: f64,
    #[serde(default)]
    beam_not_ready_delay: f64,
    #[serde(default)]
    beam_ready_delay: f64,
    #[serde(default)]
    broadcast_delay: f64,
    physics_period_count: u32,
    physics_period_duration: f64,
    #[serde(default)]
    stf_interval: Option<f64>,
    /// Units per second; the interval is its reciprocal.
    #[serde(default)]
    stf_rate: Option<f64>,
    #[serde(default)]
    stf_generation_time: f64,
    #[serde(default)]
    standby_duration: f64,
    #[serde(default)]
    beam_not_ready_end_delay: f64,
    #[serde(default)]
    stf_count: Option<u64>,
    #[serde(default)]
    max_duration: Option<f64>,
    #[serde(default)]
    allow_unbounded: bool,
}

/// Fully resolved and validated parameters of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSet {
    /// Wait in `idle` before the run is announced.
    pub pre_run_delay: Duration,
    /// Setup wait in `imminent` before the detector is ready.
    pub setup_delay: Duration,
    /// Dwell in `ready` before the first physics period.
    pub ready_delay: Duration,
    /// Wait after every run notification.
    pub broadcast_delay: Duration,
    /// Number of physics periods; 0 means unbounded.
    pub period_count: u32,
    /// Logical duration of one physics period.
    pub period_duration: Duration,
    /// Interval between consecutive data units.
    pub unit_interval: Duration,
    /// Generation cost of a single data unit.
    pub unit_cost: Duration,
    /// Standby between two physics periods.
    pub standby_duration: Duration,
    /// Cooldown after `end_run`.
    pub post_run_delay: Duration,
    /// Total number of data units to produce, across all periods.
    pub unit_count: Option<u64>,
    /// Total logical duration bound. Ignored when `unit_count` is set.
    pub max_duration: Option<Duration>,
    /// Whether an unbounded run was explicitly requested.
    pub allow_unbounded: bool,
}

impl ParameterSet {
    /// Validate a merged parameter object.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::Malformed`] for a structurally invalid
    /// object, [`ParameterError::Invalid`] for an out-of-range value, and
    /// [`ParameterError::Unbounded`] for an unbounded run without opt-in.
    pub fn from_map(params: Map<String, Value>) -> Result<Self, ParameterError> {
        let raw: RawParameters =
            serde_json::from_value(Value::Object(params)).map_err(|e| {
                ParameterError::Malformed {
                    message: e.to_string(),
                }
            })?;
        Self::try_from(raw)
    }

    /// The unit-count bound, if the run is count-governed.
    pub const fn unit_bound(&self) -> Option<u64> {
        self.unit_count
    }

    /// The duration bound, if it governs the run.
    ///
    /// A unit-count bound takes precedence, so this is `None` whenever
    /// [`unit_bound`](Self::unit_bound) is `Some`.
    pub const fn duration_bound(&self) -> Option<Duration> {
        match self.unit_count {
            Some(_) => None,
            None => self.max_duration,
        }
    }

    /// Whether the run only ends when an operator stops it.
    pub const fn is_unbounded(&self) -> bool {
        self.period_count == 0 && self.unit_count.is_none() && self.max_duration.is_none()
    }
}

impl TryFrom<RawParameters> for ParameterSet {
    type Error = ParameterError;

    fn try_from(raw: RawParameters) -> Result<Self, Self::Error> {
        let (interval_key, unit_interval) = match (raw.stf_interval, raw.stf_rate) {
            (Some(secs), None) => ("stf_interval", seconds("stf_interval", secs)?),
            (None, Some(rate)) => ("stf_rate", rate_interval(rate)?),
            (Some(_), Some(_)) => {
                return Err(ParameterError::Invalid {
                    key: "stf_rate",
                    reason: "conflicts with stf_interval; give only one".to_owned(),
                });
            }
            (None, None) => {
                return Err(ParameterError::Malformed {
                    message: "missing field `stf_interval` (or `stf_rate`)".to_owned(),
                });
            }
        };
        if unit_interval.is_zero() {
            return Err(ParameterError::Invalid {
                key: interval_key,
                reason: "must be greater than zero".to_owned(),
            });
        }
        if raw.stf_count == Some(0) {
            return Err(ParameterError::Invalid {
                key: "stf_count",
                reason: "must be greater than zero when given".to_owned(),
            });
        }
        let max_duration = raw
            .max_duration
            .map(|secs| seconds("max_duration", secs))
            .transpose()?;
        if max_duration.is_some_and(|d| d.is_zero()) {
            return Err(ParameterError::Invalid {
                key: "max_duration",
                reason: "must be greater than zero when given".to_owned(),
            });
        }
        let period_duration = seconds("physics_period_duration", raw.physics_period_duration)?;
        if raw.physics_period_count == 0 && raw.stf_count.is_none() && period_duration.is_zero()
        {
            return Err(ParameterError::Invalid {
                key: "physics_period_duration",
                reason: "must be greater than zero when periods are unbounded".to_owned(),
            });
        }

        let set = Self {
            pre_run_delay: seconds("no_beam_not_ready_delay", raw.no_beam_not_ready_delay)?,
            setup_delay: seconds("beam_not_ready_delay", raw.beam_not_ready_delay)?,
            ready_delay: seconds("beam_ready_delay", raw.beam_ready_delay)?,
            broadcast_delay: seconds("broadcast_delay", raw.broadcast_delay)?,
            period_count: raw.physics_period_count,
            period_duration,
            unit_interval,
            unit_cost: seconds("stf_generation_time", raw.stf_generation_time)?,
            standby_duration: seconds("standby_duration", raw.standby_duration)?,
            post_run_delay: seconds("beam_not_ready_end_delay", raw.beam_not_ready_end_delay)?,
            unit_count: raw.stf_count,
            max_duration,
            allow_unbounded: raw.allow_unbounded,
        };

        if set.is_unbounded() && !set.allow_unbounded {
            return Err(ParameterError::Unbounded);
        }
        Ok(set)
    }
}

/// Convert logical seconds into a [`Duration`], rejecting negative,
/// non-finite, and overflowing values.
fn seconds(key: &'static str, value: f64) -> Result<Duration, ParameterError> {
    Duration::try_from_secs_f64(value).map_err(|e| ParameterError::Invalid {
        key,
        reason: format!("{value} is not a valid duration in seconds ({e})"),
    })
}

/// Interval between units emitted at `rate` per second.
fn rate_interval(rate: f64) -> Result<Duration, ParameterError> {
    if rate.is_finite() && rate > 0.0 {
        seconds("stf_rate", rate.recip())
    } else {
        Err(ParameterError::Invalid {
            key: "stf_rate",
            reason: format!("{rate} is not a positive rate in Hz"),
        })
    }
}

/// Pairs of keys that set the same parameter.
const ALTERNATE_KEYS: [(&str, &str); 1] = [("stf_interval", "stf_rate")];

/// Layer `overrides` on top of `defaults`, key by key.
///
/// Overriding one spelling of the unit interval drops the other from the
/// defaults, so a profile written with `stf_interval` accepts an
/// `stf_rate` override and the reverse.
pub fn layer(defaults: Option<&Map<String, Value>>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.cloned().unwrap_or_default();
    for (a, b) in ALTERNATE_KEYS {
        if overrides.contains_key(a) {
            merged.remove(b);
        }
        if overrides.contains_key(b) {
            merged.remove(a);
        }
    }
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Check that a workflow name is a non-empty `[a-z0-9_]` label.
///
/// # Errors
///
/// Returns [`ParameterError::InvalidWorkflowName`] otherwise.
pub fn validate_workflow_name(name: &str) -> Result<(), ParameterError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ParameterError::InvalidWorkflowName {
            name: name.to_owned(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn minimal() -> Map<String, Value> {
        object(json!({
            "physics_period_count": 1,
            "physics_period_duration": 10.0,
            "stf_interval": 2.0,
        }))
    }

    #[test]
    fn minimal_set_uses_zero_defaults() {
        let set = ParameterSet::from_map(minimal()).unwrap();
        assert_eq!(set.period_count, 1);
        assert_eq!(set.period_duration, Duration::from_secs(10));
        assert_eq!(set.unit_interval, Duration::from_secs(2));
        assert_eq!(set.pre_run_delay, Duration::ZERO);
        assert_eq!(set.unit_cost, Duration::ZERO);
        assert!(set.unit_bound().is_none());
        assert!(!set.is_unbounded());
    }

    #[test]
    fn missing_required_key_is_malformed() {
        let mut params = minimal();
        params.remove("stf_interval");
        let err = ParameterSet::from_map(params).unwrap_err();
        assert!(matches!(err, ParameterError::Malformed { .. }));
        assert!(err.to_string().contains("stf_interval"));
    }

    #[test]
    fn unknown_key_is_malformed() {
        let mut params = minimal();
        params.insert("stf_intreval".to_owned(), json!(1));
        assert!(matches!(
            ParameterSet::from_map(params),
            Err(ParameterError::Malformed { .. })
        ));
    }

    #[test]
    fn zero_unit_count_fails_fast() {
        let mut params = minimal();
        params.insert("stf_count".to_owned(), json!(0));
        assert_eq!(
            ParameterSet::from_map(params),
            Err(ParameterError::Invalid {
                key: "stf_count",
                reason: "must be greater than zero when given".to_owned(),
            })
        );
    }

    #[test]
    fn negative_duration_is_invalid() {
        let mut params = minimal();
        params.insert("standby_duration".to_owned(), json!(-1.5));
        let err = ParameterSet::from_map(params).unwrap_err();
        assert!(matches!(
            err,
            ParameterError::Invalid {
                key: "standby_duration",
                ..
            }
        ));
    }

    #[test]
    fn negative_period_count_is_malformed() {
        let mut params = minimal();
        params.insert("physics_period_count".to_owned(), json!(-1));
        assert!(matches!(
            ParameterSet::from_map(params),
            Err(ParameterError::Malformed { .. })
        ));
    }

    #[test]
    fn zero_interval_is_invalid() {
        let mut params = minimal();
        params.insert("stf_interval".to_owned(), json!(0));
        assert!(matches!(
            ParameterSet::from_map(params),
            Err(ParameterError::Invalid {
                key: "stf_interval",
                ..
            })
        ));
    }

    #[test]
    fn zero_max_duration_is_invalid() {
        let mut params = minimal();
        params.insert("max_duration".to_owned(), json!(0));
        assert!(matches!(
            ParameterSet::from_map(params),
            Err(ParameterError::Invalid {
                key: "max_duration",
                ..
            })
        ));
    }

    #[test]
    fn zero_period_duration_needs_a_unit_count_when_periods_are_unbounded() {
        let mut params = minimal();
        params.insert("physics_period_count".to_owned(), json!(0));
        params.insert("physics_period_duration".to_owned(), json!(0));
        params.insert("allow_unbounded".to_owned(), json!(true));
        assert!(matches!(
            ParameterSet::from_map(params.clone()),
            Err(ParameterError::Invalid {
                key: "physics_period_duration",
                ..
            })
        ));

        params.insert("stf_count".to_owned(), json!(4));
        let set = ParameterSet::from_map(params).unwrap();
        assert_eq!(set.unit_bound(), Some(4));
    }

    #[test]
    fn rate_sets_the_interval() {
        let mut params = minimal();
        params.remove("stf_interval");
        params.insert("stf_rate".to_owned(), json!(4.0));
        let set = ParameterSet::from_map(params).unwrap();
        assert_eq!(set.unit_interval, Duration::from_millis(250));
    }

    #[test]
    fn rate_must_be_positive_and_alone() {
        let mut params = minimal();
        params.insert("stf_rate".to_owned(), json!(2.0));
        assert!(matches!(
            ParameterSet::from_map(params.clone()),
            Err(ParameterError::Invalid { key: "stf_rate", .. })
        ));

        params.remove("stf_interval");
        params.insert("stf_rate".to_owned(), json!(0));
        assert!(matches!(
            ParameterSet::from_map(params),
            Err(ParameterError::Invalid { key: "stf_rate", .. })
        ));
    }

    #[test]
    fn rate_override_replaces_profile_interval() {
        let profile = minimal();
        let overrides = object(json!({ "stf_rate": 10 }));
        let set = ParameterSet::from_map(layer(Some(&profile), &overrides)).unwrap();
        assert_eq!(set.unit_interval, Duration::from_millis(100));

        let profile = object(json!({
            "physics_period_count": 1,
            "physics_period_duration": 30,
            "stf_rate": 2,
        }));
        let overrides = object(json!({ "stf_interval": 3 }));
        let set = ParameterSet::from_map(layer(Some(&profile), &overrides)).unwrap();
        assert_eq!(set.unit_interval, Duration::from_secs(3));
    }

    #[test]
    fn unbounded_requires_opt_in() {
        let mut params = minimal();
        params.insert("physics_period_count".to_owned(), json!(0));
        assert_eq!(
            ParameterSet::from_map(params.clone()),
            Err(ParameterError::Unbounded)
        );

        params.insert("allow_unbounded".to_owned(), json!(true));
        let set = ParameterSet::from_map(params).unwrap();
        assert!(set.is_unbounded());
    }

    #[test]
    fn unit_count_bounds_unbounded_periods() {
        let mut params = minimal();
        params.insert("physics_period_count".to_owned(), json!(0));
        params.insert("stf_count".to_owned(), json!(25));
        let set = ParameterSet::from_map(params).unwrap();
        assert!(!set.is_unbounded());
        assert_eq!(set.unit_bound(), Some(25));
    }

    #[test]
    fn unit_count_takes_precedence_over_duration() {
        let mut params = minimal();
        params.insert("stf_count".to_owned(), json!(3));
        params.insert("max_duration".to_owned(), json!(100));
        let set = ParameterSet::from_map(params).unwrap();
        assert_eq!(set.unit_bound(), Some(3));
        assert_eq!(set.duration_bound(), None);
        assert_eq!(set.max_duration, Some(Duration::from_secs(100)));
    }

    #[test]
    fn overrides_replace_profile_keys() {
        let profile = object(json!({
            "physics_period_count": 3,
            "physics_period_duration": 60,
            "stf_interval": 1,
            "standby_duration": 5,
        }));
        let overrides = object(json!({ "physics_period_count": 1, "stf_count": 4 }));

        let merged = layer(Some(&profile), &overrides);
        let set = ParameterSet::from_map(merged).unwrap();
        assert_eq!(set.period_count, 1);
        assert_eq!(set.unit_count, Some(4));
        assert_eq!(set.standby_duration, Duration::from_secs(5));
    }

    #[test]
    fn workflow_names_are_lowercase_labels() {
        assert!(validate_workflow_name("stf_datataking").is_ok());
        assert!(validate_workflow_name("fast_processing2").is_ok());
        assert!(validate_workflow_name("").is_err());
        assert!(validate_workflow_name("STF").is_err());
        assert!(validate_workflow_name("stf-datataking").is_err());
    }
}
