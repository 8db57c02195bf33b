use std::collections::BTreeMap;

use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Scan request parameters, e.g. `"PrecursorMass" => "800.25"`. Keys must be
/// names reported by `GET_POSSIBLE_PARAMS_CMD`.
pub type ScanParams = BTreeMap<String, String>;

/// A single mass-spectrometry scan as delivered by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scan(Value);

impl Scan {
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Value {
        self.0
    }

    /// Look up a top-level field of the scan.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match &self.0 {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Integer field that the server may send as a number or as a string.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::String(s) => s.as_str()?.trim().parse().ok(),
            v => v.as_i64(),
        }
    }

    #[must_use]
    pub fn scan_number(&self) -> Option<i64> {
        self.get_i64("ScanNumber")
    }

    #[must_use]
    pub fn centroid_count(&self) -> Option<i64> {
        self.get_i64("CentroidCount")
    }

    #[must_use]
    pub fn ms_order(&self) -> Option<i64> {
        self.get_i64("MSOrder")
    }
}

impl From<Value> for Scan {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Msgpack map of string keys to string values.
#[must_use]
pub fn params_to_value(params: &ScanParams) -> Value {
    Value::Map(
        params
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
            .collect(),
    )
}
