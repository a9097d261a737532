//! Translation between raw data points and named entity values.

use crate::datapoint::{DataPointSet, DpValue};
use crate::registry::{EntityKind, Registry, Sensor};
use std::collections::BTreeMap;

/// Named values, as published to the per-entity state topics.
pub type StateMessage = BTreeMap<String, serde_json::Value>;

/// Prefix of the commands that write a single declared sensor.
pub const SET_PREFIX: &str = "set_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    /// Data points not in the registry are dropped.
    KnownOnly,
    /// Data points not in the registry are passed through under their raw DP id.
    IncludeUnknown,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("`{1}` is not a valid argument for `{0}`")]
    MalformedArgument(String, String),
    #[error("{1} is outside of the {2} range accepted by `{0}`")]
    OutOfRange(String, i64, crate::registry::ValueDomain),
    #[error("`{0}` is not a known cover command")]
    UnknownCoverCommand(String),
}

pub fn switch_payload(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

/// Interpret a command argument as a switch state.
///
/// Anything other than a (case-insensitive) `true` or `on` switches off.
pub fn parse_switch_argument(raw: &str) -> bool {
    let raw = raw.trim();
    raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("on")
}

fn named_value(sensor: &Sensor, value: &DpValue) -> serde_json::Value {
    match sensor.entity_kind {
        EntityKind::Switch => match value.as_bool() {
            Some(on) => serde_json::Value::from(switch_payload(on)),
            None => value.to_json(),
        },
        EntityKind::Number | EntityKind::Sensor => match sensor.scale {
            Some(scale) => value.scaled(scale),
            None => value.to_json(),
        },
        _ => value.to_json(),
    }
}

/// Produce named values for every data point in `dps` that the registry knows about.
///
/// A data point read by several sensors produces a value for each of them.
pub fn map_raw_to_named(dps: &DataPointSet, registry: Registry, mode: MapMode) -> StateMessage {
    let mut named = StateMessage::new();
    for (dp_id, value) in dps {
        let mut known = false;
        for sensor in registry.by_dp(dp_id) {
            known = true;
            named.insert(sensor.identifier.to_string(), named_value(sensor, value));
        }
        if !known && mode == MapMode::IncludeUnknown {
            named.insert(dp_id.clone(), value.to_json());
        }
    }
    named
}

fn parse_number(sensor: &Sensor, command: &str, raw: &str) -> Result<i64, CommandError> {
    let malformed = || CommandError::MalformedArgument(command.to_string(), raw.to_string());
    let raw = raw.trim();
    let value = match sensor.scale {
        None | Some(0) => raw.parse::<i64>().map_err(|_| malformed())?,
        Some(_) => {
            let value = raw.parse::<f64>().map_err(|_| malformed())?;
            let value = (value * sensor.divisor()).round();
            if !value.is_finite() {
                return Err(malformed());
            }
            value as i64
        }
    };
    if !sensor.accepts(value) {
        return Err(CommandError::OutOfRange(command.to_string(), value, sensor.domain));
    }
    Ok(value)
}

/// Translate a `set_<identifier>` command into the data point write it stands for.
///
/// Returns `Ok(None)` if the command does not refer to any sensor in the registry.
pub fn map_named_command_to_dp(
    registry: Registry,
    command: &str,
    raw: &str,
) -> Result<Option<DataPointSet>, CommandError> {
    let Some(identifier) = command.strip_prefix(SET_PREFIX) else {
        return Ok(None);
    };
    let Some(sensor) = registry.by_identifier(identifier) else {
        return Ok(None);
    };
    let value = match sensor.entity_kind {
        EntityKind::Switch => DpValue::Boolean(parse_switch_argument(raw)),
        EntityKind::Number => DpValue::Integer(parse_number(sensor, command, raw)?),
        _ => DpValue::String(raw.to_string()),
    };
    Ok(Some(DataPointSet::from([(sensor.dp_id.to_string(), value)])))
}
