//! Sensor identity, validation and health state.
//!
//! Everything here is pure and I/O free; the supervisor wires it to the
//! device and bus layers.

pub mod disambiguator;
pub mod reading;
pub mod state;
pub mod validator;

pub use disambiguator::{Disambiguator, HandleTable, IntervalTable};
pub use reading::{LogicalSensorId, Provenance, Reading};
pub use state::{Availability, SensorState, SensorStatus};
pub use validator::Validator;
