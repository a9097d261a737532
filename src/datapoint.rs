use std::collections::BTreeMap;

/// The state of a device as reported over the wire, keyed by the DP id.
///
/// DP ids are small integers on the wire, but are kept as strings everywhere, since that is how
/// both the device protocol and the JSON payloads refer to them.
pub type DataPointSet = BTreeMap<String, DpValue>;

/// A single raw data point value.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum DpValue {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
}

impl DpValue {
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            DpValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DpValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Divide a numeric value by `10^scale`.
    ///
    /// Values that aren't numbers and numbers with no scale are returned as they are.
    pub fn scaled(&self, scale: u8) -> serde_json::Value {
        if scale == 0 {
            return self.to_json();
        }
        let divisor = 10f64.powi(i32::from(scale));
        match *self {
            DpValue::Integer(n) => serde_json::Value::from(n as f64 / divisor),
            DpValue::Decimal(n) => serde_json::Value::from(n / divisor),
            _ => self.to_json(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DpValue::Boolean(b) => serde_json::Value::Bool(*b),
            DpValue::Integer(n) => serde_json::Value::from(*n),
            DpValue::Decimal(n) => serde_json::Value::from(*n),
            DpValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for DpValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DpValue::Boolean(b) => f.write_fmt(format_args!("{}", b)),
            DpValue::Integer(n) => f.write_fmt(format_args!("{}", n)),
            DpValue::Decimal(n) => f.write_fmt(format_args!("{}", n)),
            DpValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for DpValue {
    fn from(value: bool) -> Self {
        DpValue::Boolean(value)
    }
}

impl From<i64> for DpValue {
    fn from(value: i64) -> Self {
        DpValue::Integer(value)
    }
}

impl From<i32> for DpValue {
    fn from(value: i32) -> Self {
        DpValue::Integer(i64::from(value))
    }
}

impl From<&str> for DpValue {
    fn from(value: &str) -> Self {
        DpValue::String(value.to_string())
    }
}

impl From<String> for DpValue {
    fn from(value: String) -> Self {
        DpValue::String(value)
    }
}

/// Build a [`DataPointSet`] out of `(dp, value)` pairs.
pub fn dps<K: Into<String>, V: Into<DpValue>>(
    pairs: impl IntoIterator<Item = (K, V)>,
) -> DataPointSet {
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}
