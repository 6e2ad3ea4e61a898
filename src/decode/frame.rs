//! Binary response frames from query mode.

use super::Measurement;
use crate::device::FrameLayout;
use crate::error::DecodeError;

/// Raw values the firmware uses to flag a failed sensor read.
const FAULT_SENTINELS: [i16; 2] = [i16::MAX, i16::MIN];

/// Decode a response frame.
///
/// The header must match the model signature exactly; a mismatching frame
/// is rejected whole rather than partially interpreted.
pub fn decode_frame(frame: &[u8], layout: &FrameLayout) -> Result<Measurement, DecodeError> {
    let header = frame.get(..layout.header.len()).ok_or_else(|| {
        DecodeError::PatternMismatch(format!("frame too short ({} bytes)", frame.len()))
    })?;
    if header != layout.header {
        return Err(DecodeError::PatternMismatch(format!(
            "header {:02x?}, expected {:02x?}",
            header, layout.header
        )));
    }

    let temperature = read_i16_be(frame, layout.temperature_offset)?;
    let humidity = read_i16_be(frame, layout.humidity_offset)?;

    for (quantity, raw) in [("temperature", temperature), ("humidity", humidity)] {
        if FAULT_SENTINELS.contains(&raw) {
            return Err(DecodeError::ChecksumOrRangeFailure(format!(
                "{} fault value {:#06x}",
                quantity, raw as u16
            )));
        }
    }

    Ok(Measurement {
        temperature_celsius: f64::from(temperature) / FrameLayout::SCALE,
        humidity_percent: f64::from(humidity) / FrameLayout::SCALE,
    })
}

fn read_i16_be(frame: &[u8], offset: usize) -> Result<i16, DecodeError> {
    frame
        .get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .map(i16::from_be_bytes)
        .ok_or_else(|| {
            DecodeError::ChecksumOrRangeFailure(format!(
                "field at offset {} beyond {}-byte frame",
                offset,
                frame.len()
            ))
        })
}
