//! Maps the provenance of a decoded value to a logical sensor.
//!
//! Devices do not report a stable identifier in their data. In query mode the
//! USB port a handle sits on identifies the sensor; in capture mode the
//! reporting interval typed after each reading does. Both are plain lookup
//! tables so the convention can be replaced without touching callers.

use super::reading::{LogicalSensorId, Provenance};
use crate::error::UnknownProvenance;
use std::collections::{BTreeMap, HashMap};

pub trait Disambiguator: Send {
    /// Resolve the sensor that produced a value with the given provenance.
    fn assign(&self, provenance: &Provenance) -> Result<LogicalSensorId, UnknownProvenance>;

    /// All sensors this table can ever assign, in configuration order.
    fn sensors(&self) -> Vec<LogicalSensorId>;
}

/// USB port -> sensor (query mode).
///
/// Ports are bound to sensors in configuration order the first time they are
/// seen, in enumeration order. A binding never changes while the process
/// runs: a sensor whose device is unplugged stays unbound from every other
/// port until its own port comes back.
#[derive(Debug, Clone)]
pub struct HandleTable {
    ids: Vec<LogicalSensorId>,
    ports: BTreeMap<String, LogicalSensorId>,
}

impl HandleTable {
    pub fn new(ids: Vec<LogicalSensorId>) -> Self {
        Self {
            ids,
            ports: BTreeMap::new(),
        }
    }

    /// Bind unseen ports to sensors that have no port yet.
    ///
    /// Returns the bindings made by this call.
    pub fn bind<I, S>(&mut self, ports: I) -> Vec<(String, LogicalSensorId)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = Vec::new();
        for port in ports {
            let port = port.as_ref();
            if self.ports.contains_key(port) {
                continue;
            }
            let Some(id) = self
                .ids
                .iter()
                .find(|id| self.port_of(id).is_none())
                .cloned()
            else {
                break;
            };
            self.ports.insert(port.to_string(), id.clone());
            added.push((port.to_string(), id));
        }
        added
    }

    pub fn port_of(&self, id: &LogicalSensorId) -> Option<&str> {
        self.ports
            .iter()
            .find(|(_, bound)| *bound == id)
            .map(|(port, _)| port.as_str())
    }
}

impl Disambiguator for HandleTable {
    fn assign(&self, provenance: &Provenance) -> Result<LogicalSensorId, UnknownProvenance> {
        match provenance {
            Provenance::Port(port) => self
                .ports
                .get(port)
                .cloned()
                .ok_or_else(|| UnknownProvenance(provenance.to_string())),
            Provenance::Interval(_) => Err(UnknownProvenance(provenance.to_string())),
        }
    }

    fn sensors(&self) -> Vec<LogicalSensorId> {
        self.ids.clone()
    }
}

/// Reporting interval -> sensor (capture mode).
#[derive(Debug, Clone)]
pub struct IntervalTable {
    by_interval: HashMap<u32, LogicalSensorId>,
    order: Vec<LogicalSensorId>,
}

impl IntervalTable {
    pub fn new(entries: impl IntoIterator<Item = (u32, LogicalSensorId)>) -> Self {
        let mut by_interval = HashMap::new();
        let mut order = Vec::new();
        for (interval, id) in entries {
            order.push(id.clone());
            by_interval.insert(interval, id);
        }
        Self { by_interval, order }
    }
}

impl Disambiguator for IntervalTable {
    fn assign(&self, provenance: &Provenance) -> Result<LogicalSensorId, UnknownProvenance> {
        match provenance {
            Provenance::Interval(secs) => self
                .by_interval
                .get(secs)
                .cloned()
                .ok_or_else(|| UnknownProvenance(provenance.to_string())),
            Provenance::Port(_) => Err(UnknownProvenance(provenance.to_string())),
        }
    }

    fn sensors(&self) -> Vec<LogicalSensorId> {
        self.order.clone()
    }
}
