//! HID climate bridge library.
//!
//! Reads temperature/humidity from keyboard-emulating USB HID sensors, either
//! by querying the devices over hidraw or by capturing the text they type,
//! and publishes per-sensor readings and availability to MQTT.

pub mod capture;
pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod instance_lock;
pub mod publish;
pub mod sensors;
pub mod supervisor;
