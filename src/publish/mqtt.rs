//! MQTT bus backed by rumqttc.

use super::topics::Topics;
use super::{Bus, Message};
use crate::config::MqttConfig;
use crate::error::PublishError;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS,
};
use std::time::Duration;
use tokio::sync::watch;

/// Requests buffered inside rumqttc between the client and the event loop.
const CLIENT_CAPACITY: usize = 100;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Publishing side of the MQTT connection.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    session: watch::Receiver<Option<u64>>,
}

/// Event loop side; must be driven by [`MqttConnection::run`] for anything
/// to reach the broker.
pub struct MqttConnection {
    event_loop: EventLoop,
    session: watch::Sender<Option<u64>>,
}

/// Create the client pair.
///
/// The broker retains `offline` on the bridge status topic if this process
/// disappears without disconnecting.
pub fn connect(config: &MqttConfig, topics: &Topics) -> (MqttBus, MqttConnection) {
    let mut options = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        topics.bridge_status(),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));

    // Set credentials if provided
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    let (client, event_loop) = AsyncClient::new(options, CLIENT_CAPACITY);
    let (session_tx, session_rx) = watch::channel(None);

    (
        MqttBus {
            client,
            session: session_rx,
        },
        MqttConnection {
            event_loop,
            session: session_tx,
        },
    )
}

impl MqttBus {
    /// Send a clean disconnect; the connection loop exits once it is out.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("[MQTT] Disconnect request failed: {}", e);
        }
    }
}

#[async_trait]
impl Bus for MqttBus {
    fn session(&self) -> Option<u64> {
        *self.session.borrow()
    }

    /// `Ok` means queued in the client, not acknowledged by the broker. With a
    /// clean session, in-flight messages die with the connection; the worker
    /// re-sends the last reading per sensor after each new session.
    async fn publish(&self, message: &Message) -> Result<(), PublishError> {
        debug!("Publishing to {}: {}", message.topic, message.payload);
        self.client
            .try_publish(
                &message.topic,
                QoS::AtLeastOnce,
                message.retain,
                message.payload.as_bytes(),
            )
            .map_err(|e| PublishError::BusUnavailable(e.to_string()))
    }
}

impl MqttConnection {
    /// Drive the event loop, reconnecting with exponential backoff.
    ///
    /// Every accepted CONNACK starts a new session number, which is what tells
    /// the publisher to re-announce discovery metadata. Returns after a clean
    /// disconnect has been sent.
    pub async fn run(mut self) {
        info!("Starting MQTT event loop");

        let mut sessions: u64 = 0;
        let mut backoff = RECONNECT_MIN;

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        sessions += 1;
                        backoff = RECONNECT_MIN;
                        info!("[MQTT] Connected (session {})", sessions);
                        self.session.send_replace(Some(sessions));
                    } else {
                        warn!("[MQTT] Connection refused: {:?}", ack.code);
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("[MQTT] Disconnected");
                    self.session.send_replace(None);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    if self.session.send_replace(None).is_some() {
                        warn!("[MQTT] Connection lost: {}", e);
                    } else {
                        error!("[MQTT] Connection error: {:?}", e);
                    }
                    // Wait before reconnecting
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                }
            }
        }
    }
}
