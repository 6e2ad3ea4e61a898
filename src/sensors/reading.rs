//! Canonical decoded sensor values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a configured sensor (e.g. `sensor_1`).
///
/// Assigned once per configured sensor and never reused for another
/// physical role while the process runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalSensorId(String);

impl LogicalSensorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalSensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalSensorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One temperature/humidity measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(temperature_celsius: f64, humidity_percent: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            temperature_celsius,
            humidity_percent,
            captured_at,
        }
    }

    /// Reading stamped with the current wall clock.
    pub fn now(temperature_celsius: f64, humidity_percent: f64) -> Self {
        Self::new(temperature_celsius, humidity_percent, Utc::now())
    }
}

/// Which source produced a decoded value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// USB port the HID handle sits on (query mode).
    Port(String),
    /// Reporting interval suffix in seconds (capture mode).
    Interval(u32),
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Port(port) => write!(f, "port {}", port),
            Provenance::Interval(secs) => write!(f, "interval {}S", secs),
        }
    }
}
