//! Sensor identifiers, readings and listing entries.
//!
//! A reading is a single scalar value with a unit. Readings never hide
//! failure: a provider that could not produce a value reports `ok == false`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, session-stable name of a hardware counter (e.g. `cpu.load`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(String);

impl SensorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SensorId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A single poll of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Current value (meaningless when `ok` is false)
    pub value: f64,
    /// Unit suffix as the provider reports it (`%`, `°C`, `MB/s`)
    pub unit: String,
    /// When the provider produced the value
    pub timestamp: DateTime<Utc>,
    /// Whether the value is usable
    pub ok: bool,
}

impl Reading {
    /// A successful reading taken now.
    ///
    /// Non-finite values are never reported as `ok`.
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
            ok: value.is_finite(),
        }
    }

    /// A failed reading taken now.
    pub fn failed(unit: impl Into<String>) -> Self {
        Self {
            value: f64::NAN,
            unit: unit.into(),
            timestamp: Utc::now(),
            ok: false,
        }
    }

    /// True if the value can be plotted.
    pub fn is_usable(&self) -> bool {
        self.ok && self.value.is_finite()
    }
}

/// Listing entry shown in the property inspector's sensor picker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorInfo {
    pub id: SensorId,
    pub display_name: String,
    pub unit: String,
}

impl SensorInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            id: SensorId::new(id),
            display_name: display_name.into(),
            unit: unit.into(),
        }
    }
}

/// Errors raised by sensor providers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    /// The identifier does not name any sensor of this provider
    #[error("sensor not found: {0}")]
    NotFound(SensorId),
    /// The provider failed while reading an existing sensor
    #[error("sensor provider error: {0}")]
    Provider(String),
}
