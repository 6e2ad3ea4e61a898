//! Recording bus for unit testing

use super::{Bus, Message};
use crate::error::PublishError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Bus that records every publish. Starts disconnected.
#[derive(Clone, Default)]
pub struct RecordingBus {
    inner: Arc<Mutex<RecordingBusInner>>,
}

#[derive(Default)]
struct RecordingBusInner {
    session: Option<u64>,
    sessions: u64,
    published: Vec<Message>,
    fail_next: usize,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a (re)connect; each call starts a new session
    pub fn connect(&self) {
        let mut inner = self.inner.lock();
        inner.sessions += 1;
        inner.session = Some(inner.sessions);
    }

    pub fn disconnect(&self) {
        self.inner.lock().session = None;
    }

    /// Make the next `n` publishes fail while staying connected
    pub fn fail_next(&self, n: usize) {
        self.inner.lock().fail_next = n;
    }

    pub fn clear(&self) {
        self.inner.lock().published.clear();
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().published.clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner
            .lock()
            .published
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }

    /// Payload of the most recent publish on `topic`
    pub fn payload_of(&self, topic: &str) -> Option<String> {
        self.inner
            .lock()
            .published
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .map(|m| m.payload.clone())
    }

    pub fn count_of(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .count()
    }
}

#[async_trait]
impl Bus for RecordingBus {
    fn session(&self) -> Option<u64> {
        self.inner.lock().session
    }

    async fn publish(&self, message: &Message) -> Result<(), PublishError> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(PublishError::BusUnavailable("disconnected".into()));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(PublishError::BusUnavailable("injected failure".into()));
        }
        inner.published.push(message.clone());
        Ok(())
    }
}
