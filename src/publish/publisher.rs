//! At-least-once delivery of readings and availability to the bus.
//!
//! The supervisor only ever touches [`Publisher`], whose calls never block on
//! bus I/O: they overwrite the sensor's slot in a latest-value outbox and wake
//! the [`PublisherWorker`]. The worker owns the bus, re-announces discovery
//! metadata whenever a new bus session starts, and retries with exponential
//! backoff before giving up on the pending readings.
//!
//! A successful bus publish only means the message was handed to the client,
//! and a new session discards whatever the old one still had in flight. The
//! last reading sent for each sensor is therefore sent again after every
//! announcement; a repeated retained value is harmless.

use super::discovery::DiscoveryDescriptor;
use super::topics::{Quantity, Topics};
use super::{Bus, Message};
use crate::config::PublishConfig;
use crate::error::PublishError;
use crate::sensors::{Availability, LogicalSensorId, Reading};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How often the worker re-checks the bus session without being woken.
const RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Pending publishes. Superseded values are simply replaced: sensor data is
/// a current-state stream, not an event log.
#[derive(Debug, Default)]
struct Outbox {
    readings: BTreeMap<LogicalSensorId, Reading>,
    availability: BTreeMap<LogicalSensorId, Availability>,
    /// Last availability per sensor, re-sent on every new session.
    last_availability: BTreeMap<LogicalSensorId, Availability>,
    /// Last reading handed to the bus per sensor, re-sent on every new session.
    last_sent: BTreeMap<LogicalSensorId, Reading>,
    /// Session for which discovery has been announced.
    announced_session: Option<u64>,
}

impl Outbox {
    fn is_empty(&self) -> bool {
        self.readings.is_empty() && self.availability.is_empty()
    }

    /// Put back entries that failed to send unless a newer value arrived.
    fn restore(
        &mut self,
        availability: impl IntoIterator<Item = (LogicalSensorId, Availability)>,
        readings: impl IntoIterator<Item = (LogicalSensorId, Reading)>,
    ) {
        for (id, a) in availability {
            self.availability.entry(id).or_insert(a);
        }
        for (id, r) in readings {
            self.readings.entry(id).or_insert(r);
        }
    }
}

struct Shared {
    outbox: Mutex<Outbox>,
    wake: Notify,
}

/// Non-blocking handle used by the supervisor.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    /// Create the handle and the worker that drains it into `bus`.
    pub fn new<B: Bus>(
        bus: B,
        topics: Topics,
        descriptors: Vec<DiscoveryDescriptor>,
        config: PublishConfig,
    ) -> (Self, PublisherWorker<B>) {
        let shared = Arc::new(Shared {
            outbox: Mutex::new(Outbox::default()),
            wake: Notify::new(),
        });
        let worker = PublisherWorker {
            shared: shared.clone(),
            bus,
            topics,
            descriptors,
            config,
        };
        (Self { shared }, worker)
    }

    /// Queue a reading for `id`, replacing any unsent one.
    pub fn publish(&self, id: &LogicalSensorId, reading: Reading) {
        self.shared
            .outbox
            .lock()
            .readings
            .insert(id.clone(), reading);
        self.shared.wake.notify_one();
    }

    /// Queue an availability change for `id`.
    pub fn publish_availability(&self, id: &LogicalSensorId, availability: Availability) {
        {
            let mut outbox = self.shared.outbox.lock();
            outbox.availability.insert(id.clone(), availability);
            outbox.last_availability.insert(id.clone(), availability);
        }
        self.shared.wake.notify_one();
    }

    /// Number of publishes waiting for the bus.
    pub fn pending(&self) -> usize {
        let outbox = self.shared.outbox.lock();
        outbox.readings.len() + outbox.availability.len()
    }

    pub fn pending_reading(&self, id: &LogicalSensorId) -> Option<Reading> {
        self.shared.outbox.lock().readings.get(id).copied()
    }

    pub fn pending_availability(&self, id: &LogicalSensorId) -> Option<Availability> {
        self.shared.outbox.lock().availability.get(id).copied()
    }
}

/// Owns the bus connection side of publishing.
pub struct PublisherWorker<B: Bus> {
    shared: Arc<Shared>,
    bus: B,
    topics: Topics,
    descriptors: Vec<DiscoveryDescriptor>,
    config: PublishConfig,
}

impl<B: Bus> PublisherWorker<B> {
    /// Drain the outbox until `shutdown`, then make one bounded final flush.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut resync = tokio::time::interval(RESYNC_INTERVAL);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.shared.wake.notified() => {}
                _ = resync.tick() => {}
            }
            self.drain(&shutdown).await;
        }

        let limit = Duration::from_millis(self.config.shutdown_flush_ms);
        match tokio::time::timeout(limit, self.final_flush()).await {
            Ok(Ok(())) => info!("[Publisher] Final flush complete"),
            Ok(Err(e)) => warn!("[Publisher] Final flush failed: {}", e),
            Err(_) => warn!("[Publisher] Final flush timed out after {:?}", limit),
        }
        let abandoned = self.abandon();
        if abandoned > 0 {
            warn!("[Publisher] Abandoned {} unsent publish(es)", abandoned);
        }
    }

    /// Flush with retries; on exhaustion drop pending data and wait for the
    /// next cycle instead of holding on indefinitely.
    async fn drain(&mut self, shutdown: &CancellationToken) {
        if !self.has_work() {
            return;
        }

        let mut delay = Duration::from_millis(self.config.backoff_ms);
        let max_delay = Duration::from_millis(self.config.backoff_max_ms);

        for attempt in 0..=self.config.max_retries {
            match self.flush().await {
                Ok(()) => return,
                Err(e) => {
                    if attempt == self.config.max_retries {
                        warn!("[Publisher] Giving up after {} attempt(s): {}", attempt + 1, e);
                        break;
                    }
                    debug!("[Publisher] Attempt {} failed: {}", attempt + 1, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(jitter(delay)) => {}
                    }
                    delay = (delay * 2).min(max_delay);
                }
            }
        }

        let dropped = self.abandon();
        if dropped > 0 {
            warn!("[Publisher] Dropped {} pending publish(es)", dropped);
        }
    }

    fn has_work(&self) -> bool {
        let outbox = self.shared.outbox.lock();
        match self.bus.session() {
            Some(session) => !outbox.is_empty() || outbox.announced_session != Some(session),
            None => !outbox.is_empty(),
        }
    }

    /// Drop everything pending. Availability survives in `last_availability`
    /// and goes out again with the next announcement.
    fn abandon(&mut self) -> usize {
        let mut outbox = self.shared.outbox.lock();
        let dropped = outbox.readings.len() + outbox.availability.len();
        outbox.readings.clear();
        outbox.availability.clear();
        outbox.announced_session = None;
        dropped
    }

    /// Last flush before exit, ending with the bridge going `offline`. A clean
    /// disconnect suppresses the last will, so this is the only place that
    /// status reaches the broker on an orderly shutdown.
    async fn final_flush(&mut self) -> Result<(), PublishError> {
        self.flush().await?;
        self.bus
            .publish(&Message::retained(self.topics.bridge_status(), "offline"))
            .await
    }

    /// One delivery attempt of everything pending.
    pub(crate) async fn flush(&mut self) -> Result<(), PublishError> {
        let session = self
            .bus
            .session()
            .ok_or_else(|| PublishError::BusUnavailable("not connected".to_string()))?;

        let announced = self.shared.outbox.lock().announced_session;
        if announced != Some(session) {
            self.announce(session).await?;
        }

        let (availability, readings) = {
            let mut outbox = self.shared.outbox.lock();
            (
                std::mem::take(&mut outbox.availability),
                std::mem::take(&mut outbox.readings),
            )
        };

        let mut availability = availability.into_iter();
        while let Some((id, a)) = availability.next() {
            if let Err(e) = self.bus.publish(&self.availability_message(&id, a)).await {
                let rest = std::iter::once((id, a)).chain(availability);
                self.shared.outbox.lock().restore(rest, readings);
                return Err(e);
            }
        }

        let mut readings = readings.into_iter();
        while let Some((id, reading)) = readings.next() {
            if let Err(e) = self.publish_reading(&id, &reading).await {
                let rest = std::iter::once((id, reading)).chain(readings);
                self.shared.outbox.lock().restore(std::iter::empty(), rest);
                return Err(e);
            }
            self.shared.outbox.lock().last_sent.insert(id, reading);
        }

        Ok(())
    }

    /// Bridge status, discovery for every sensor, then last known availability.
    /// Readings already sent in an earlier session are queued again behind it.
    async fn announce(&mut self, session: u64) -> Result<(), PublishError> {
        info!(
            "[Publisher] Bus session {}: announcing {} sensor(s)",
            session,
            self.descriptors.len()
        );

        self.bus
            .publish(&Message::retained(self.topics.bridge_status(), "online"))
            .await?;

        for descriptor in &self.descriptors {
            for message in &descriptor.messages {
                self.bus.publish(message).await?;
            }
        }

        let last: Vec<_> = self
            .shared
            .outbox
            .lock()
            .last_availability
            .iter()
            .map(|(id, a)| (id.clone(), *a))
            .collect();
        for (id, a) in &last {
            self.bus.publish(&self.availability_message(id, *a)).await?;
        }

        let mut outbox = self.shared.outbox.lock();
        for (id, a) in &last {
            if outbox.availability.get(id) == Some(a) {
                outbox.availability.remove(id);
            }
        }
        let resend: Vec<_> = outbox
            .last_sent
            .iter()
            .map(|(id, r)| (id.clone(), *r))
            .collect();
        outbox.restore(std::iter::empty(), resend);
        outbox.announced_session = Some(session);
        Ok(())
    }

    async fn publish_reading(
        &self,
        id: &LogicalSensorId,
        reading: &Reading,
    ) -> Result<(), PublishError> {
        let values = [
            (Quantity::Temperature, reading.temperature_celsius),
            (Quantity::Humidity, reading.humidity_percent),
        ];
        for (quantity, value) in values {
            let message = Message::retained(self.topics.state(id, quantity), format!("{:.2}", value));
            self.bus.publish(&message).await?;
        }
        Ok(())
    }

    fn availability_message(&self, id: &LogicalSensorId, availability: Availability) -> Message {
        Message::retained(self.topics.availability(id), availability.as_ref())
    }
}

/// Up to 25% random extra delay so reconnecting bridges do not synchronize.
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.25);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;
    use crate::publish::mock::RecordingBus;
    use tokio_test::{assert_err, assert_ok};

    fn setup() -> (Publisher, PublisherWorker<RecordingBus>, RecordingBus) {
        let topics = Topics::new("sensors", "homeassistant", "bridge");
        let sensors = vec![
            SensorConfig::new("sensor_1", "Living Room", Some(1)),
            SensorConfig::new("sensor_2", "Bedroom", Some(2)),
        ];
        let descriptors = DiscoveryDescriptor::for_sensors(&sensors, &topics);
        let bus = RecordingBus::new();
        let config = PublishConfig {
            max_retries: 2,
            backoff_ms: 1,
            backoff_max_ms: 2,
            shutdown_flush_ms: 100,
        };
        let (publisher, worker) = Publisher::new(bus.clone(), topics, descriptors, config);
        (publisher, worker, bus)
    }

    fn id(s: &str) -> LogicalSensorId {
        LogicalSensorId::from(s)
    }

    #[tokio::test]
    async fn test_first_flush_announces_then_publishes() {
        let (publisher, mut worker, bus) = setup();
        bus.connect();
        publisher.publish(&id("sensor_1"), Reading::now(29.54, 39.58));

        assert_ok!(worker.flush().await);

        let topics = bus.topics();
        assert_eq!(topics[0], "sensors/bridge/status");
        assert_eq!(
            topics.iter().filter(|t| t.ends_with("/config")).count(),
            4
        );
        assert_eq!(
            bus.payload_of("sensors/sensor_1/temperature").as_deref(),
            Some("29.54")
        );
        assert_eq!(
            bus.payload_of("sensors/sensor_1/humidity").as_deref(),
            Some("39.58")
        );
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn test_newer_reading_supersedes_unsent_one() {
        let (publisher, mut worker, bus) = setup();
        publisher.publish(&id("sensor_1"), Reading::now(20.0, 40.0));
        publisher.publish(&id("sensor_1"), Reading::now(21.0, 41.0));
        assert_eq!(publisher.pending(), 1);

        bus.connect();
        assert_ok!(worker.flush().await);
        assert_eq!(bus.count_of("sensors/sensor_1/temperature"), 1);
        assert_eq!(
            bus.payload_of("sensors/sensor_1/temperature").as_deref(),
            Some("21.00")
        );
    }

    #[tokio::test]
    async fn test_reconnect_reannounces_before_readings() {
        let (publisher, mut worker, bus) = setup();
        publisher.publish_availability(&id("sensor_1"), Availability::Online);
        bus.connect();
        assert_ok!(worker.flush().await);

        // Outage: the reading stays buffered
        bus.disconnect();
        publisher.publish(&id("sensor_2"), Reading::now(27.60, 40.38));
        assert_err!(worker.flush().await);
        assert_eq!(publisher.pending(), 1);

        bus.clear();
        bus.connect();
        assert_ok!(worker.flush().await);

        let topics = bus.topics();
        let first_reading = topics
            .iter()
            .position(|t| t == "sensors/sensor_2/temperature")
            .unwrap();
        let last_config = topics.iter().rposition(|t| t.ends_with("/config")).unwrap();
        assert_eq!(
            topics.iter().filter(|t| t.ends_with("/config")).count(),
            4
        );
        assert!(last_config < first_reading);
        // Availability re-sent as part of the announcement
        assert_eq!(
            bus.payload_of("sensors/sensor_1/availability").as_deref(),
            Some("online")
        );
    }

    #[tokio::test]
    async fn test_readings_from_dropped_session_are_resent() {
        let (publisher, mut worker, bus) = setup();
        bus.connect();
        publisher.publish(&id("sensor_1"), Reading::now(29.54, 39.58));
        assert_ok!(worker.flush().await);
        assert_eq!(bus.count_of("sensors/sensor_1/temperature"), 1);

        // The broker never saw it: the session ended with it still in flight
        bus.disconnect();
        bus.clear();
        bus.connect();
        assert_ok!(worker.flush().await);

        let topics = bus.topics();
        let last_config = topics.iter().rposition(|t| t.ends_with("/config")).unwrap();
        let resent = topics
            .iter()
            .position(|t| t == "sensors/sensor_1/temperature")
            .unwrap();
        assert!(last_config < resent);
        assert_eq!(
            bus.payload_of("sensors/sensor_1/humidity").as_deref(),
            Some("39.58")
        );
        // Nothing to resend for a sensor that never reported
        assert_eq!(bus.count_of("sensors/sensor_2/temperature"), 0);
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn test_newer_reading_wins_over_resend() {
        let (publisher, mut worker, bus) = setup();
        bus.connect();
        publisher.publish(&id("sensor_1"), Reading::now(20.0, 40.0));
        assert_ok!(worker.flush().await);

        bus.disconnect();
        publisher.publish(&id("sensor_1"), Reading::now(21.0, 41.0));
        bus.clear();
        bus.connect();
        assert_ok!(worker.flush().await);

        assert_eq!(bus.count_of("sensors/sensor_1/temperature"), 1);
        assert_eq!(
            bus.payload_of("sensors/sensor_1/temperature").as_deref(),
            Some("21.00")
        );
    }

    #[tokio::test]
    async fn test_failed_publish_is_restored() {
        let (publisher, mut worker, bus) = setup();
        bus.connect();
        assert_ok!(worker.flush().await);

        bus.fail_next(1);
        publisher.publish(&id("sensor_1"), Reading::now(22.0, 50.0));
        assert_err!(worker.flush().await);
        assert_eq!(
            publisher.pending_reading(&id("sensor_1")).map(|r| r.temperature_celsius),
            Some(22.0)
        );

        assert_ok!(worker.flush().await);
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_and_drops_readings() {
        let (publisher, mut worker, bus) = setup();
        publisher.publish(&id("sensor_1"), Reading::now(22.0, 50.0));
        publisher.publish_availability(&id("sensor_1"), Availability::Online);

        let shutdown = CancellationToken::new();
        worker.drain(&shutdown).await;
        assert_eq!(publisher.pending(), 0);
        assert!(bus.topics().is_empty());

        // Availability is still announced once the bus comes back
        bus.connect();
        worker.drain(&shutdown).await;
        assert_eq!(
            bus.payload_of("sensors/sensor_1/availability").as_deref(),
            Some("online")
        );
        assert_eq!(bus.count_of("sensors/sensor_1/temperature"), 0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_wake_and_stops_on_shutdown() {
        let (publisher, worker, bus) = setup();
        bus.connect();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(worker.run(shutdown.clone()));

        publisher.publish(&id("sensor_2"), Reading::now(27.6, 40.38));
        for _ in 0..100 {
            if bus.count_of("sensors/sensor_2/humidity") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            bus.payload_of("sensors/sensor_2/humidity").as_deref(),
            Some("40.38")
        );

        shutdown.cancel();
        assert_ok!(task.await);
        assert_eq!(
            bus.payload_of("sensors/bridge/status").as_deref(),
            Some("offline")
        );
        assert_eq!(bus.topics().last().map(String::as_str), Some("sensors/bridge/status"));
    }
}
