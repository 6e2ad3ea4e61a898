//! Decoders turning raw device output into measurements.
//!
//! Query mode produces fixed binary frames ([`frame`]); capture mode produces
//! typed text, either read directly as lines ([`line`]) or reassembled from
//! keyboard events ([`keystroke`]).

pub mod frame;
pub mod keystroke;
pub mod line;

use crate::sensors::Reading;
use chrono::{DateTime, Utc};

pub use frame::decode_frame;
pub use keystroke::KeystrokeDecoder;
pub use line::{ParsedLine, parse_line};

/// Temperature and humidity as decoded, before timestamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
}

impl Measurement {
    pub fn at(self, captured_at: DateTime<Utc>) -> Reading {
        Reading::new(self.temperature_celsius, self.humidity_percent, captured_at)
    }
}
