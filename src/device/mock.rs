//! Scripted transport and a fake sysfs tree for unit testing

use super::locator::{DeviceLocator, SensorHandle};
use super::models::KNOWN_MODELS;
use super::transport::{RawFrame, Transport};
use crate::error::TransportError;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Handle for the first known model at `path`.
pub fn handle(port: usize, path: &str) -> SensorHandle {
    SensorHandle {
        path: PathBuf::from(path),
        phys: format!("usb-0000:00:14.0-{}/input1", port + 1),
        name: "PCsensor TEMPerHUM".to_string(),
        model: KNOWN_MODELS[0],
    }
}

/// Transport replaying queued results in order.
///
/// Once the queue is empty every exchange reports `NotReady`.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    responses: VecDeque<Result<RawFrame, TransportError>>,
    calls: Vec<PathBuf>,
    stall: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next exchange
    pub fn push(&self, response: Result<RawFrame, TransportError>) {
        self.inner.lock().unwrap().responses.push_back(response);
    }

    /// Make every exchange hang for `duration`, ignoring its timeout
    pub fn stall(&self, duration: Duration) {
        self.inner.lock().unwrap().stall = Some(duration);
    }

    /// Number of transact attempts made so far
    pub fn calls(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    /// Device paths in the order they were queried
    pub fn called_paths(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().calls.clone()
    }
}

impl Transport for MockTransport {
    fn transact(
        &self,
        handle: &SensorHandle,
        _query: &[u8],
        _response_len: usize,
        _timeout: Duration,
    ) -> Result<RawFrame, TransportError> {
        let stall = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(handle.path.clone());
            inner.stall
        };
        if let Some(duration) = stall {
            std::thread::sleep(duration);
        }

        self.inner
            .lock()
            .unwrap()
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::NotReady("no scripted response".into())))
    }
}

/// Throwaway `/sys/class/hidraw` lookalike under the temp dir.
pub struct FakeSysfs {
    root: PathBuf,
}

impl FakeSysfs {
    pub fn new(name: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "hid-climate-bridge-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    pub fn add(&self, node: &str, hid_id: &str, phys: &str) {
        let dir = self.root.join(node).join("device");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("uevent"),
            format!(
                "DRIVER=hid-generic\nHID_ID={}\nHID_NAME=PCsensor TEMPerHUM\nHID_PHYS={}\n",
                hid_id, phys
            ),
        )
        .unwrap();
    }

    /// Simulate an unplug.
    pub fn remove(&self, node: &str) {
        fs::remove_dir_all(self.root.join(node)).unwrap();
    }

    pub fn locator(&self) -> DeviceLocator {
        DeviceLocator::new(&self.root, KNOWN_MODELS.to_vec())
    }
}

impl Drop for FakeSysfs {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
