//! Message bus publishing: topics, discovery metadata, the buffering
//! publisher and the MQTT transport behind it.

pub mod discovery;
#[cfg(test)]
pub mod mock;
pub mod mqtt;
pub mod publisher;
pub mod topics;

use crate::error::PublishError;
use async_trait::async_trait;

pub use discovery::DiscoveryDescriptor;
pub use mqtt::{MqttBus, MqttConnection};
pub use publisher::{Publisher, PublisherWorker};
pub use topics::{Quantity, Topics};

/// One publish on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Message {
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }
}

/// Message bus as seen by the publisher worker.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Identifier of the current connection, `None` while disconnected.
    ///
    /// Changes on every successful (re)connect.
    fn session(&self) -> Option<u64>;

    async fn publish(&self, message: &Message) -> Result<(), PublishError>;
}
