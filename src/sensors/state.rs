//! Per-sensor health tracking.
//!
//! Status moves `Initializing -> Online -> Degraded -> Offline`. A success
//! from `Degraded` returns to `Online`; a success from `Offline` re-enters
//! `Degraded`. Availability is derived from status and is what gets published.

use super::reading::Reading;
use serde::Serialize;
use strum::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Initializing,
    Online,
    Degraded,
    Offline,
}

/// Published liveness of a sensor (`online` / `offline` payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
}

impl SensorStatus {
    pub fn availability(self) -> Availability {
        match self {
            SensorStatus::Online | SensorStatus::Degraded => Availability::Online,
            SensorStatus::Initializing | SensorStatus::Offline => Availability::Offline,
        }
    }
}

/// Mutable record owned by the supervisor for one logical sensor.
#[derive(Debug, Clone, Serialize)]
pub struct SensorState {
    pub last_reading: Option<Reading>,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub status: SensorStatus,
}

impl Default for SensorState {
    fn default() -> Self {
        Self {
            last_reading: None,
            consecutive_errors: 0,
            total_errors: 0,
            status: SensorStatus::Initializing,
        }
    }
}

impl SensorState {
    pub fn availability(&self) -> Availability {
        self.status.availability()
    }

    /// Record an accepted reading.
    ///
    /// Returns the new availability if it changed.
    pub fn record_success(&mut self, reading: Reading) -> Option<Availability> {
        let before = self.availability();
        self.last_reading = Some(reading);
        self.consecutive_errors = 0;
        self.status = match self.status {
            SensorStatus::Offline => SensorStatus::Degraded,
            _ => SensorStatus::Online,
        };
        changed(before, self.availability())
    }

    /// Record a failed cycle (transport, decode, validation or staleness).
    ///
    /// Returns the new availability if it changed.
    pub fn record_failure(&mut self, offline_threshold: u32) -> Option<Availability> {
        let before = self.availability();
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.total_errors += 1;
        self.status = if self.consecutive_errors >= offline_threshold {
            SensorStatus::Offline
        } else {
            match self.status {
                SensorStatus::Online => SensorStatus::Degraded,
                other => other,
            }
        };
        changed(before, self.availability())
    }
}

fn changed(before: Availability, after: Availability) -> Option<Availability> {
    (before != after).then_some(after)
}
