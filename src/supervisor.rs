//! The acquisition loop.
//!
//! The supervisor is the only writer of per-sensor state. Each cycle runs the
//! pipeline (locate, exchange, decode, assign, validate, publish) for every
//! configured sensor. Per-sensor errors are counted against that sensor and
//! never abort the loop or affect other sensors.

use crate::decode::{ParsedLine, decode_frame, parse_line};
use crate::device::{DeviceLocator, SensorHandle, Transport};
use crate::error::{SensorError, TransportError};
use crate::publish::Publisher;
use crate::sensors::{
    Availability, Disambiguator, HandleTable, LogicalSensorId, Provenance, Reading, SensorState,
    SensorStatus, Validator,
};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of one sensor.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub id: LogicalSensorId,
    pub status: SensorStatus,
    pub availability: Availability,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub last_reading: Option<Reading>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub cycles: u64,
    pub unknown_provenance: u64,
    pub ignored_lines: u64,
    pub sensors: Vec<SensorSnapshot>,
}

/// Why the capture loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureExit {
    Shutdown,
    SourceClosed,
}

pub struct Supervisor {
    order: Vec<LogicalSensorId>,
    states: BTreeMap<LogicalSensorId, SensorState>,
    last_accepted_at: HashMap<LogicalSensorId, Instant>,
    validator: Validator,
    publisher: Publisher,
    offline_threshold: u32,
    summary_every: u64,
    cycles: u64,
    unknown_provenance: u64,
    unknown_seen: HashSet<Provenance>,
    ignored_lines: u64,
}

impl Supervisor {
    pub fn new(
        sensors: Vec<LogicalSensorId>,
        validator: Validator,
        publisher: Publisher,
        offline_threshold: u32,
        summary_every: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            states: sensors
                .iter()
                .map(|id| (id.clone(), SensorState::default()))
                .collect(),
            last_accepted_at: sensors.iter().map(|id| (id.clone(), now)).collect(),
            order: sensors,
            validator,
            publisher,
            offline_threshold,
            summary_every,
            cycles: 0,
            unknown_provenance: 0,
            unknown_seen: HashSet::new(),
            ignored_lines: 0,
        }
    }

    /// Publish the initial (offline) availability of every sensor.
    pub fn start(&self) {
        for id in &self.order {
            if let Some(state) = self.states.get(id) {
                self.publisher.publish_availability(id, state.availability());
            }
        }
    }

    /// Mark every sensor offline on the bus before exiting.
    pub fn shutdown(&mut self) {
        for id in &self.order {
            self.publisher
                .publish_availability(id, Availability::Offline);
        }
        info!("{}", self.summary());
    }

    /// Validate and publish a decoded reading for `id`.
    pub fn accept(&mut self, id: &LogicalSensorId, reading: Reading) {
        let Some(state) = self.states.get_mut(id) else {
            warn!("[{}] reading for unconfigured sensor dropped", id);
            return;
        };

        match self.validator.validate(reading, state.last_reading.as_ref()) {
            Ok(reading) => {
                let transition = state.record_success(reading);
                debug!(
                    "[{}] {:.2}°C {:.2}% ({})",
                    id, reading.temperature_celsius, reading.humidity_percent, state.status
                );
                self.last_accepted_at.insert(id.clone(), Instant::now());
                self.publisher.publish(id, reading);
                if let Some(availability) = transition {
                    info!("[{}] now {} ({})", id, availability, state.status);
                    self.publisher.publish_availability(id, availability);
                }
            }
            Err(rejection) => self.fail(id, SensorError::Validation(rejection)),
        }
    }

    /// Count one failed cycle against `id`.
    pub fn fail(&mut self, id: &LogicalSensorId, error: SensorError) {
        let Some(state) = self.states.get_mut(id) else {
            return;
        };

        let transition = state.record_failure(self.offline_threshold);
        warn!(
            "[{}] cycle {} at {}: {} ({} consecutive)",
            id,
            self.cycles,
            Utc::now().format("%H:%M:%S%.3f"),
            error,
            state.consecutive_errors
        );
        if let Some(availability) = transition {
            warn!("[{}] now {}", id, availability);
            self.publisher.publish_availability(id, availability);
        }
    }

    /// Classify one captured line and route it to its sensor.
    pub fn handle_line(&mut self, line: &str, table: &dyn Disambiguator) {
        match parse_line(line) {
            ParsedLine::Reading {
                measurement,
                interval_secs,
            } => {
                let provenance = Provenance::Interval(interval_secs);
                match table.assign(&provenance) {
                    Ok(id) => self.accept(&id, measurement.at(Utc::now())),
                    Err(unknown) => self.record_unknown(provenance, unknown.to_string()),
                }
            }
            ParsedLine::Banner(text) => {
                self.ignored_lines += 1;
                debug!("Ignoring banner: {:?}", text);
            }
            ParsedLine::Unrecognized(text) => {
                self.ignored_lines += 1;
                debug!("Ignoring unrecognized line: {:?}", text);
            }
        }
    }

    fn record_unknown(&mut self, provenance: Provenance, detail: String) {
        self.unknown_provenance += 1;
        if self.unknown_seen.insert(provenance) {
            warn!("Discarding reading: {}", detail);
        } else {
            debug!("Discarding reading: {}", detail);
        }
    }

    /// Count a failure for every sensor without an accepted reading within
    /// `stale_after`; each elapsed window counts once.
    pub fn check_staleness(&mut self, now: Instant, stale_after: Duration) {
        let stale: Vec<LogicalSensorId> = self
            .order
            .iter()
            .filter(|id| {
                self.last_accepted_at
                    .get(*id)
                    .is_some_and(|at| now.saturating_duration_since(*at) >= stale_after)
            })
            .cloned()
            .collect();

        for id in stale {
            self.last_accepted_at.insert(id.clone(), now);
            self.fail(&id, SensorError::Stale(stale_after));
        }
    }

    pub fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            cycles: self.cycles,
            unknown_provenance: self.unknown_provenance,
            ignored_lines: self.ignored_lines,
            sensors: self
                .order
                .iter()
                .filter_map(|id| {
                    self.states.get(id).map(|state| SensorSnapshot {
                        id: id.clone(),
                        status: state.status,
                        availability: state.availability(),
                        consecutive_errors: state.consecutive_errors,
                        total_errors: state.total_errors,
                        last_reading: state.last_reading,
                    })
                })
                .collect(),
        }
    }

    fn summary(&self) -> String {
        let snapshot = self.snapshot();
        let sensors: Vec<String> = snapshot
            .sensors
            .iter()
            .map(|s| match &s.last_reading {
                Some(r) => format!(
                    "{}={} {:.2}°C/{:.2}% errors={}",
                    s.id, s.status, r.temperature_celsius, r.humidity_percent, s.total_errors
                ),
                None => format!("{}={} errors={}", s.id, s.status, s.total_errors),
            })
            .collect();
        format!(
            "Status after {} cycle(s): {} (unknown={}, ignored lines={}, pending publishes={})",
            snapshot.cycles,
            sensors.join(", "),
            snapshot.unknown_provenance,
            snapshot.ignored_lines,
            self.publisher.pending()
        )
    }

    fn end_cycle(&mut self) {
        self.cycles += 1;
        if self.summary_every > 0 && self.cycles % self.summary_every == 0 {
            info!("{}", self.summary());
        }
    }

    /// One query-mode cycle over all configured sensors.
    pub async fn poll_cycle(&mut self, query: &mut QueryMode) {
        for (id, outcome) in query.acquire().await {
            match outcome {
                Ok(reading) => self.accept(&id, reading),
                Err(error) => self.fail(&id, error),
            }
        }
        self.end_cycle();
    }

    /// Poll at a fixed cadence until `shutdown`.
    pub async fn run_query(
        mut self,
        mut query: QueryMode,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!(
            "Polling {} sensor(s) every {:?}",
            self.order.len(),
            poll_interval
        );
        self.start();

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.poll_cycle(&mut query).await;
        }

        self.shutdown();
    }

    /// Consume captured lines until `shutdown` or until the source closes.
    pub async fn run_capture<D: Disambiguator>(
        mut self,
        mut lines: mpsc::Receiver<String>,
        table: D,
        stale_after: Duration,
        check_every: Duration,
        shutdown: CancellationToken,
    ) -> CaptureExit {
        info!(
            "Capturing {} sensor(s), offline after {} silent window(s) of {:?}",
            self.order.len(),
            self.offline_threshold,
            stale_after
        );
        self.start();

        let mut ticker = tokio::time::interval(check_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let exit = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break CaptureExit::Shutdown,
                line = lines.recv() => match line {
                    Some(line) => self.handle_line(&line, &table),
                    None => {
                        warn!("Capture source closed");
                        break CaptureExit::SourceClosed;
                    }
                },
                _ = ticker.tick() => {
                    self.check_staleness(Instant::now(), stale_after);
                    self.end_cycle();
                }
            }
        };

        self.shutdown();
        exit
    }
}

/// Slack on top of the transport's own deadlines before a blocked exchange
/// is abandoned.
const EXCHANGE_MARGIN: Duration = Duration::from_millis(100);

/// Query-mode acquisition: device handles, transport and the port table.
pub struct QueryMode {
    locator: DeviceLocator,
    transport: Arc<dyn Transport>,
    table: HandleTable,
    timeout: Duration,
    handles: BTreeMap<LogicalSensorId, SensorHandle>,
    rediscover: bool,
}

impl QueryMode {
    pub fn new(
        locator: DeviceLocator,
        transport: Arc<dyn Transport>,
        table: HandleTable,
        timeout: Duration,
    ) -> Self {
        Self {
            locator,
            transport,
            table,
            timeout,
            handles: BTreeMap::new(),
            rediscover: true,
        }
    }

    /// At most one discovery per cycle, and only when a device went missing.
    fn refresh_handles(&mut self) {
        if !self.rediscover {
            return;
        }
        self.rediscover = false;
        let discovered = self.locator.discover();

        for (port, id) in self.table.bind(discovered.iter().map(SensorHandle::port)) {
            info!("[{}] bound to port {}", id, port);
        }

        self.handles.clear();
        for handle in discovered {
            match self.table.assign(&Provenance::Port(handle.port())) {
                Ok(id) => {
                    debug!("[{}] at {}", id, handle.path.display());
                    self.handles.insert(id, handle);
                }
                Err(_) => warn!(
                    "{} ({}) has no configured sensor, ignoring",
                    handle.path.display(),
                    handle.phys
                ),
            }
        }

        info!(
            "Discovered {} of {} configured sensor(s)",
            self.handles.len(),
            self.table.sensors().len()
        );
    }

    /// Exchange with every configured sensor in configuration order.
    pub async fn acquire(&mut self) -> Vec<(LogicalSensorId, Result<Reading, SensorError>)> {
        self.refresh_handles();

        let mut results = Vec::new();
        for id in self.table.sensors() {
            let outcome = match self.handles.get(&id).cloned() {
                Some(handle) => self.read_handle(handle).await,
                None => {
                    let detail = match self.table.port_of(&id) {
                        Some(port) => format!("no device on port {}", port),
                        None => "no device bound yet".to_string(),
                    };
                    Err(SensorError::Transport(TransportError::Disconnected(detail)))
                }
            };

            if matches!(
                outcome,
                Err(SensorError::Transport(TransportError::Disconnected(_)))
            ) {
                self.rediscover = true;
            }
            results.push((id, outcome));
        }
        results
    }

    async fn read_handle(&self, handle: SensorHandle) -> Result<Reading, SensorError> {
        let transport = self.transport.clone();
        let timeout = self.timeout;
        let layout = handle.model.layout;
        let path = handle.path.clone();

        // Two transacts when the first response is malformed
        let limit = timeout * 2 + EXCHANGE_MARGIN;
        let task = tokio::task::spawn_blocking(move || {
            transport.exchange(&handle, &handle.model.query, layout.frame_len, timeout)
        });

        let frame = match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined
                .map_err(|e| TransportError::NotReady(format!("exchange task failed: {}", e)))??,
            Err(_) => {
                warn!("{}: exchange still blocked after {:?}", path.display(), limit);
                return Err(TransportError::NotReady(format!(
                    "exchange exceeded {:?}",
                    limit
                ))
                .into());
            }
        };

        let measurement = decode_frame(&frame, &layout)?;
        Ok(measurement.at(Utc::now()))
    }
}
