//! Static data point tables.
//!
//! Every device kind declares which data points it exposes, what they are called and how their
//! raw values are to be interpreted. The tables are composed out of shared slices: a plug, for
//! instance, is the switch channel plus the metering extension.
//!
//! See <https://developer.tuya.com/en/docs/iot/product-standard-function-introduction> for the
//! standard function codes the identifiers are named after.

/// What kind of an entity a data point is exposed as.
///
/// The names double as the component names in discovery topics.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumString,
    strum::VariantNames,
    serde::Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EntityKind {
    Sensor,
    BinarySensor,
    Switch,
    Number,
    Cover,
}

impl EntityKind {
    /// Whether entities of this kind accept commands.
    pub fn is_writable(self) -> bool {
        matches!(self, EntityKind::Switch | EntityKind::Number | EntityKind::Cover)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueDomain {
    Boolean,
    Range { min: i64, max: i64 },
    Enum(&'static [&'static str]),
    /// The device does not constrain the value (e.g. encoded schedules.)
    Any,
}

impl std::fmt::Display for ValueDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueDomain::Boolean => f.write_str("true|false"),
            ValueDomain::Range { min, max } => f.write_fmt(format_args!("{min}..={max}")),
            ValueDomain::Enum(values) => f.write_str(&values.join("|")),
            ValueDomain::Any => f.write_str("*"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Sensor {
    pub dp_id: &'static str,
    pub identifier: &'static str,
    pub entity_kind: EntityKind,
    pub domain: ValueDomain,
    /// Raw integers carry the value multiplied by `10^scale`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
    /// Granularity of the value, in raw units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
}

impl Sensor {
    pub const fn new(
        dp_id: &'static str,
        identifier: &'static str,
        entity_kind: EntityKind,
        domain: ValueDomain,
    ) -> Self {
        Self {
            dp_id,
            identifier,
            entity_kind,
            domain,
            scale: None,
            step: None,
            unit: None,
            device_class: None,
        }
    }

    pub const fn scale(mut self, scale: u8) -> Self {
        self.scale = Some(scale);
        self
    }

    pub const fn step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    pub const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub const fn device_class(mut self, device_class: &'static str) -> Self {
        self.device_class = Some(device_class);
        self
    }

    /// The divisor between raw and human-facing values.
    pub fn divisor(&self) -> f64 {
        10f64.powi(i32::from(self.scale.unwrap_or(0)))
    }

    /// Numeric bounds and step in human-facing units.
    pub fn display_bounds(&self) -> Option<(f64, f64)> {
        let ValueDomain::Range { min, max } = self.domain else {
            return None;
        };
        let divisor = self.divisor();
        Some((min as f64 / divisor, max as f64 / divisor))
    }

    pub fn display_step(&self) -> Option<f64> {
        self.step.map(|s| f64::from(s) / self.divisor())
    }

    /// Whether the raw command value fits into the declared domain.
    pub fn accepts(&self, raw: i64) -> bool {
        match self.domain {
            ValueDomain::Range { min, max } => (min..=max).contains(&raw),
            _ => true,
        }
    }
}

/// A device kind's table of sensors, possibly composed out of several shared slices.
#[derive(Clone, Copy)]
pub struct Registry {
    parts: &'static [&'static [Sensor]],
}

impl Registry {
    pub const EMPTY: Registry = Registry { parts: &[] };

    pub const fn composed(parts: &'static [&'static [Sensor]]) -> Self {
        Self { parts }
    }

    pub fn iter(self) -> impl Iterator<Item = &'static Sensor> {
        self.parts.iter().flat_map(|part| part.iter())
    }

    pub fn len(self) -> usize {
        self.parts.iter().map(|part| part.len()).sum()
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn by_identifier(self, identifier: &str) -> Option<&'static Sensor> {
        self.iter().find(|s| s.identifier == identifier)
    }

    /// All the sensors reading the given data point.
    pub fn by_dp(self, dp_id: &str) -> impl Iterator<Item = &'static Sensor> + use<> {
        let dp_id = dp_id.to_string();
        self.iter().filter(move |s| s.dp_id == dp_id)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

const BOOLEAN: ValueDomain = ValueDomain::Boolean;
const ANY: ValueDomain = ValueDomain::Any;

const fn range(min: i64, max: i64) -> ValueDomain {
    ValueDomain::Range { min, max }
}

macro_rules! sensors {
    ($($dp: literal is $id: literal: $kind: ident, $domain: expr $(, $opt: ident = $val: expr)*;)*) => {
        &[$(Sensor::new($dp, $id, EntityKind::$kind, $domain)$(.$opt($val))*,)*]
    }
}

/// The relay channel shared by every switch-like device.
const SWITCH_CHANNEL: &[Sensor] = sensors! {
    "1" is "switch_1": Switch, BOOLEAN;
    "9" is "countdown_1": Number, range(0, 86400), step = 1, scale = 0, unit = "s";
};

const SWITCH_EXTENSION: &[Sensor] = sensors! {
    "14" is "relay_status": Sensor, ValueDomain::Enum(&["off", "on", "memory"]),
        device_class = "enum";
};

const PLUG_EXTENSION: &[Sensor] = sensors! {
    // incremental consumption since the last report
    "17" is "add_ele": Sensor, range(0, 50000), step = 100, scale = 3, unit = "kWh",
        device_class = "energy";
    "18" is "cur_current": Sensor, range(0, 30000), step = 1, scale = 0, unit = "mA",
        device_class = "current";
    "19" is "cur_power": Sensor, range(0, 80000), step = 1, scale = 1, unit = "W",
        device_class = "power";
    "20" is "cur_voltage": Sensor, range(0, 5000), step = 1, scale = 1, unit = "V",
        device_class = "voltage";
    "21" is "test_bit": Sensor, range(0, 5), step = 1, scale = 0;
    "22" is "voltage_coe": Sensor, range(0, 1000000), step = 1, scale = 0;
    "23" is "electric_coe": Sensor, range(0, 1000000), step = 1, scale = 0;
    "24" is "power_coe": Sensor, range(0, 1000000), step = 1, scale = 0;
    "25" is "electricity_coe": Sensor, range(0, 1000000), step = 1, scale = 0;
    "26" is "fault": Sensor, ValueDomain::Enum(&["ov_vol", "ov_pwr", "ls_cr", "ls_vol", "ls_pow"]),
        device_class = "enum";
    "38" is "relay_status": Sensor, ValueDomain::Enum(&["off", "on", "memory"]),
        device_class = "enum";
    "41" is "cycle_time": Sensor, ANY;
    "42" is "random_time": Sensor, ANY;
};

const COVER_CHANNEL: &[Sensor] = sensors! {
    // The motion DP doubles as a plain sensor exposing the raw command.
    "1" is "control": Sensor, ValueDomain::Enum(&["open", "stop", "close"]),
        device_class = "enum";
    "7" is "backlight": Switch, BOOLEAN;
    "8" is "control_back": Switch, BOOLEAN;
};

pub const SWITCH: Registry = Registry::composed(&[SWITCH_CHANNEL, SWITCH_EXTENSION]);
pub const PLUG: Registry = Registry::composed(&[SWITCH_CHANNEL, PLUG_EXTENSION]);
pub const COVER: Registry = Registry::composed(&[COVER_CHANNEL]);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn identifiers_unique(registry: Registry) -> bool {
        let unique = registry.iter().map(|s| s.identifier).collect::<BTreeSet<_>>();
        unique.len() == registry.len()
    }

    #[test]
    fn identifiers_are_unique_within_a_registry() {
        assert!(identifiers_unique(SWITCH));
        assert!(identifiers_unique(PLUG));
        assert!(identifiers_unique(COVER));
    }

    #[test]
    fn plug_extends_the_switch_channel() {
        let plug = PLUG.iter().map(|s| s.identifier).collect::<Vec<_>>();
        assert_eq!(&plug[..2], ["switch_1", "countdown_1"]);
        assert_eq!(PLUG.len(), 15);
        assert_eq!(PLUG.by_identifier("relay_status").unwrap().dp_id, "38");
        assert_eq!(SWITCH.by_identifier("relay_status").unwrap().dp_id, "14");
    }

    #[test]
    fn lookup_by_dp() {
        let found = COVER.by_dp("1").map(|s| s.identifier).collect::<Vec<_>>();
        assert_eq!(found, ["control"]);
        assert_eq!(PLUG.by_dp("99").count(), 0);
        assert!(Registry::EMPTY.is_empty());
    }

    #[test]
    fn scaled_bounds() {
        let power = PLUG.by_identifier("cur_power").unwrap();
        assert_eq!(power.display_bounds(), Some((0.0, 8000.0)));
        assert_eq!(power.display_step(), Some(0.1));
        let energy = PLUG.by_identifier("add_ele").unwrap();
        assert_eq!(energy.display_step(), Some(0.1));
        let countdown = SWITCH.by_identifier("countdown_1").unwrap();
        assert!(countdown.accepts(86400));
        assert!(!countdown.accepts(86401));
        assert!(!countdown.accepts(-1));
    }

    #[test]
    fn entity_kind_names() {
        assert_eq!(EntityKind::BinarySensor.to_string(), "binary_sensor");
        assert_eq!("number".parse::<EntityKind>().unwrap(), EntityKind::Number);
    }
}
