//! Plausibility checks applied before a reading may be published.

use super::reading::Reading;
use crate::config::ValidationConfig;
use crate::error::ValidationRejection;
use chrono::Duration;

pub struct Validator {
    config: ValidationConfig,
    skew_tolerance: Duration,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        let skew_tolerance = Duration::milliseconds(config.clock_skew_tolerance_ms as i64);
        Self {
            config,
            skew_tolerance,
        }
    }

    /// Accept or reject `reading` given the sensor's last accepted reading.
    ///
    /// A timestamp may lag the previous one by at most the configured skew
    /// tolerance.
    pub fn validate(
        &self,
        reading: Reading,
        last_accepted: Option<&Reading>,
    ) -> Result<Reading, ValidationRejection> {
        check_range(
            "temperature",
            reading.temperature_celsius,
            self.config.temperature_min,
            self.config.temperature_max,
        )?;
        check_range(
            "humidity",
            reading.humidity_percent,
            self.config.humidity_min,
            self.config.humidity_max,
        )?;

        if let Some(last) = last_accepted
            && reading.captured_at < last.captured_at - self.skew_tolerance
        {
            return Err(ValidationRejection::NonMonotonicTimestamp {
                captured_at: reading.captured_at,
                last: last.captured_at,
            });
        }

        Ok(reading)
    }
}

fn check_range(
    quantity: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ValidationRejection> {
    // NaN fails both comparisons, so test for containment rather than exclusion
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ValidationRejection::OutOfRange {
            quantity,
            value,
            min,
            max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn validator() -> Validator {
        Validator::new(ValidationConfig::default())
    }

    fn at(ms: i64, t: f64, h: f64) -> Reading {
        Reading::new(t, h, Utc.timestamp_millis_opt(ms).unwrap())
    }

    #[test]
    fn test_accepts_plausible_reading() {
        let reading = at(1_000, 21.5, 45.0);
        assert_eq!(validator().validate(reading, None), Ok(reading));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let v = validator();
        assert!(v.validate(at(0, -40.0, 0.0), None).is_ok());
        assert!(v.validate(at(0, 80.0, 100.0), None).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range() {
        let v = validator();
        for (t, h) in [
            (-40.01, 50.0),
            (80.01, 50.0),
            (20.0, -0.01),
            (20.0, 100.01),
            (f64::NAN, 50.0),
        ] {
            assert!(
                matches!(
                    v.validate(at(0, t, h), None),
                    Err(ValidationRejection::OutOfRange { .. })
                ),
                "expected rejection for t={} h={}",
                t,
                h
            );
        }
    }

    #[test]
    fn test_small_backwards_skew_is_tolerated() {
        let v = validator();
        let last = at(10_000, 20.0, 40.0);
        assert!(v.validate(at(9_700, 20.0, 40.0), Some(&last)).is_ok());
    }

    #[test]
    fn test_rejects_timestamp_beyond_skew() {
        let v = validator();
        let last = at(10_000, 20.0, 40.0);
        assert!(matches!(
            v.validate(at(9_000, 20.0, 40.0), Some(&last)),
            Err(ValidationRejection::NonMonotonicTimestamp { .. })
        ));
    }
}
