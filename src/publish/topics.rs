//! MQTT topic layout.

use crate::config::MqttConfig;
use crate::sensors::LogicalSensorId;
use strum::{AsRefStr, Display, EnumIter};

/// A measured quantity with its own state topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Quantity {
    Temperature,
    Humidity,
}

impl Quantity {
    pub fn unit(self) -> &'static str {
        match self {
            Quantity::Temperature => "°C",
            Quantity::Humidity => "%",
        }
    }

    /// Home Assistant device class.
    pub fn device_class(self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Quantity::Temperature => "Temperature",
            Quantity::Humidity => "Humidity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    discovery_prefix: String,
    node_id: String,
}

impl Topics {
    pub fn new(
        prefix: impl Into<String>,
        discovery_prefix: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            discovery_prefix: discovery_prefix.into(),
            node_id: node_id.into(),
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(
            &config.topic_prefix,
            &config.discovery_prefix,
            &config.node_id,
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// `<prefix>/<id>/temperature` or `<prefix>/<id>/humidity`
    pub fn state(&self, id: &LogicalSensorId, quantity: Quantity) -> String {
        format!("{}/{}/{}", self.prefix, id, quantity)
    }

    /// `<prefix>/<id>/availability`
    pub fn availability(&self, id: &LogicalSensorId) -> String {
        format!("{}/{}/availability", self.prefix, id)
    }

    /// Bridge liveness, also used as the MQTT last will.
    pub fn bridge_status(&self) -> String {
        format!("{}/{}/status", self.prefix, self.node_id)
    }

    /// `<discovery_prefix>/sensor/<node>_<id>_<quantity>/config`
    pub fn discovery(&self, id: &LogicalSensorId, quantity: Quantity) -> String {
        format!(
            "{}/sensor/{}/config",
            self.discovery_prefix,
            self.object_id(id, quantity)
        )
    }

    pub fn object_id(&self, id: &LogicalSensorId, quantity: Quantity) -> String {
        format!("{}_{}_{}", self.node_id, id, quantity)
    }
}
