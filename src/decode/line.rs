//! Text lines typed by sensors in keyboard-emulation mode.
//!
//! A reading looks like `29.54[C]39.58[%RH]1S`: temperature, humidity and the
//! sensor's reporting interval in seconds. On activation the devices also type
//! an identification banner (e.g. a vendor URL), and two devices typing at the
//! same time can interleave into garbage. Classification is pure so it can be
//! tested without any I/O.

use super::Measurement;

const TEMPERATURE_MARK: &str = "[C]";
const HUMIDITY_MARK: &str = "[%RH]";
const INTERVAL_SUFFIX: char = 'S';

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Reading {
        measurement: Measurement,
        /// Reporting interval marker, used to tell sensors apart.
        interval_secs: u32,
    },
    /// Identification text the device types once; expected noise.
    Banner(String),
    /// Anything else, typically corrupted or interleaved output.
    Unrecognized(String),
}

pub fn parse_line(raw: &str) -> ParsedLine {
    let line = raw.trim_matches(|c: char| c.is_whitespace() || c.is_control());

    if let Some((measurement, interval_secs)) = parse_reading(line) {
        return ParsedLine::Reading {
            measurement,
            interval_secs,
        };
    }

    if is_banner(line) {
        ParsedLine::Banner(line.to_string())
    } else {
        ParsedLine::Unrecognized(line.to_string())
    }
}

fn parse_reading(line: &str) -> Option<(Measurement, u32)> {
    let (temperature, rest) = line.split_once(TEMPERATURE_MARK)?;
    let (humidity, rest) = rest.split_once(HUMIDITY_MARK)?;
    let interval = rest.strip_suffix(INTERVAL_SUFFIX)?;

    if interval.is_empty() || !interval.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some((
        Measurement {
            temperature_celsius: parse_decimal(temperature)?,
            humidity_percent: parse_decimal(humidity)?,
        },
        interval.parse().ok()?,
    ))
}

/// `-?\d+(\.\d+)?`; stricter than `f64::from_str`, which would also accept
/// `inf`, exponents and a bare `.5`.
fn parse_decimal(s: &str) -> Option<f64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let (int, frac) = match digits.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (digits, None),
    };

    let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int) || !frac.is_none_or(all_digits) {
        return None;
    }
    s.parse().ok()
}

/// Printable text carrying none of the measurement markers.
fn is_banner(line: &str) -> bool {
    !line.is_empty()
        && line.chars().any(|c| c.is_ascii_alphabetic())
        && line.chars().all(|c| c.is_ascii_graphic() || c == ' ')
        && !line.contains('[')
        && !line.contains(']')
}
