//! Known HID sensor models and their report layouts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// USB vendor/product identifier pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

impl FromStr for UsbId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vendor, product) = s.split_once(':').unwrap_or((s, ""));
        Ok(Self {
            vendor: u16::from_str_radix(vendor.trim(), 16)?,
            product: u16::from_str_radix(product.trim(), 16)?,
        })
    }
}

/// Byte layout of a query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Total response length in bytes.
    pub frame_len: usize,
    /// Static signature expected at the start of every response.
    pub header: [u8; 2],
    /// Offset of the big-endian i16 temperature (centidegrees).
    pub temperature_offset: usize,
    /// Offset of the big-endian i16 relative humidity (centipercent).
    pub humidity_offset: usize,
}

impl FrameLayout {
    /// Fixed-point divisor for both fields.
    pub const SCALE: f64 = 100.0;
}

/// A HID sensor model the bridge knows how to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceModel {
    pub name: &'static str,
    pub id: UsbId,
    /// USB interface carrying the vendor reports (the other one is the keyboard).
    pub interface: u8,
    pub query: [u8; 8],
    pub layout: FrameLayout,
}

/// Query frame for the TEMPerHUM family: "read temperature and humidity".
pub const TEMPERHUM_QUERY: [u8; 8] = [0x01, 0x80, 0x33, 0x01, 0x00, 0x00, 0x00, 0x00];

pub const TEMPERHUM_LAYOUT: FrameLayout = FrameLayout {
    frame_len: 8,
    header: [0x80, 0x80],
    temperature_offset: 2,
    humidity_offset: 4,
};

pub const KNOWN_MODELS: &[DeviceModel] = &[
    DeviceModel {
        name: "TEMPerHUM",
        id: UsbId {
            vendor: 0x413d,
            product: 0x2107,
        },
        interface: 1,
        query: TEMPERHUM_QUERY,
        layout: TEMPERHUM_LAYOUT,
    },
    DeviceModel {
        name: "TEMPerHUM V4",
        id: UsbId {
            vendor: 0x3553,
            product: 0xa001,
        },
        interface: 1,
        query: TEMPERHUM_QUERY,
        layout: TEMPERHUM_LAYOUT,
    },
];

/// Build the model table: the built-in models plus user-supplied ids that
/// speak the TEMPerHUM protocol.
pub fn model_table(extra: &[UsbId]) -> Vec<DeviceModel> {
    let mut models = KNOWN_MODELS.to_vec();
    for id in extra {
        if models.iter().any(|m| m.id == *id) {
            continue;
        }
        models.push(DeviceModel {
            name: "TEMPerHUM compatible",
            id: *id,
            interface: 1,
            query: TEMPERHUM_QUERY,
            layout: TEMPERHUM_LAYOUT,
        });
    }
    models
}
