//! Home Assistant MQTT discovery metadata.
//!
//! Each configured sensor is announced as two entities (temperature and
//! humidity) grouped under one device, so the platform can create them
//! without manual configuration.

use super::Message;
use super::topics::{Quantity, Topics};
use crate::config::SensorConfig;
use crate::sensors::LogicalSensorId;
use serde_json::json;
use strum::IntoEnumIterator;

/// Discovery messages for one logical sensor, built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDescriptor {
    pub sensor: LogicalSensorId,
    pub display_name: String,
    pub messages: Vec<Message>,
}

impl DiscoveryDescriptor {
    pub fn new(sensor: &SensorConfig, topics: &Topics) -> Self {
        let messages = Quantity::iter()
            .map(|quantity| Message {
                topic: topics.discovery(&sensor.id, quantity),
                payload: entity_config(sensor, topics, quantity).to_string(),
                retain: true,
            })
            .collect();

        Self {
            sensor: sensor.id.clone(),
            display_name: sensor.name.clone(),
            messages,
        }
    }

    /// Descriptors for every configured sensor, in configuration order.
    pub fn for_sensors(sensors: &[SensorConfig], topics: &Topics) -> Vec<Self> {
        sensors.iter().map(|s| Self::new(s, topics)).collect()
    }
}

fn entity_config(sensor: &SensorConfig, topics: &Topics, quantity: Quantity) -> serde_json::Value {
    let object_id = topics.object_id(&sensor.id, quantity);
    json!({
        "name": quantity.label(),
        "unique_id": object_id,
        "object_id": object_id,
        "state_topic": topics.state(&sensor.id, quantity),
        "unit_of_measurement": quantity.unit(),
        "device_class": quantity.device_class(),
        "state_class": "measurement",
        "suggested_display_precision": 1,
        "availability": [
            { "topic": topics.bridge_status() },
            { "topic": topics.availability(&sensor.id) },
        ],
        "availability_mode": "all",
        "payload_available": "online",
        "payload_not_available": "offline",
        "device": {
            "identifiers": [format!("{}_{}", topics.node_id(), sensor.id)],
            "name": sensor.name,
            "manufacturer": "PCsensor",
            "model": "TEMPerHUM",
        },
    })
}
