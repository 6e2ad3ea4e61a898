//! USB HID device access: discovery, model table and the query transport.

pub mod locator;
#[cfg(test)]
pub mod mock;
pub mod models;
pub mod transport;

pub use locator::{DeviceLocator, SensorHandle};
pub use models::{DeviceModel, FrameLayout, KNOWN_MODELS, UsbId, model_table};
pub use transport::{HidrawTransport, RawFrame, Transport};
