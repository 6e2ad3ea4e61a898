use hid_climate_bridge::capture::{self, CaptureSource, LINE_QUEUE_DEPTH};
use hid_climate_bridge::config::{self, AcquisitionMode, Config};
use hid_climate_bridge::device::{DeviceLocator, HidrawTransport, model_table};
use hid_climate_bridge::error::{BridgeError, Result};
use hid_climate_bridge::instance_lock::InstanceLock;
use hid_climate_bridge::publish::{self, DiscoveryDescriptor, Publisher, Topics};
use hid_climate_bridge::sensors::{HandleTable, IntervalTable, LogicalSensorId, Validator};
use hid_climate_bridge::supervisor::{CaptureExit, QueryMode, Supervisor};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How often capture mode checks for silent sensors.
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for the MQTT disconnect to go out after the final flush.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

enum Acquisition {
    Query(QueryMode),
    Capture {
        lines: mpsc::Receiver<String>,
        table: IntervalTable,
    },
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    // Load .env file before anything else
    config::load_dotenv();
    init_logger();
    info!("Starting HID climate bridge");

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("HID climate bridge stopped");
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    config.validate()?;
    let _lock = InstanceLock::acquire()?;

    info!("Configuration loaded:");
    info!(
        "  MQTT broker: {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    info!("  Mode: {}", config.acquisition.mode);
    for sensor in &config.sensors {
        match sensor.interval_secs {
            Some(secs) => info!("  Sensor: {} ({}, {}S)", sensor.id, sensor.name, secs),
            None => info!("  Sensor: {} ({})", sensor.id, sensor.name),
        }
    }

    // Open the acquisition side first so an unusable source fails before
    // anything is announced on the bus
    let acquisition = open_acquisition(&config)?;

    let topics = Topics::from_config(&config.mqtt);
    let (bus, connection) = publish::mqtt::connect(&config.mqtt, &topics);
    let connection_task = tokio::spawn(connection.run());

    let descriptors = DiscoveryDescriptor::for_sensors(&config.sensors, &topics);
    let (publisher, worker) =
        Publisher::new(bus.clone(), topics, descriptors, config.publish.clone());

    // Separate tokens: the worker must outlive the supervisor long enough to
    // deliver the final offline availability
    let shutdown = CancellationToken::new();
    let publisher_shutdown = CancellationToken::new();
    let worker_task = tokio::spawn(worker.run(publisher_shutdown.clone()));
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let ids: Vec<LogicalSensorId> = config.sensors.iter().map(|s| s.id.clone()).collect();
    let supervisor = Supervisor::new(
        ids,
        Validator::new(config.validation.clone()),
        publisher,
        config.supervisor.offline_threshold,
        config.supervisor.summary_every,
    );

    let outcome = match acquisition {
        Acquisition::Query(query) => {
            supervisor
                .run_query(query, config.acquisition.poll_interval(), shutdown.clone())
                .await;
            Ok(())
        }
        Acquisition::Capture { lines, table } => {
            let exit = supervisor
                .run_capture(
                    lines,
                    table,
                    config.acquisition.stale_after(),
                    STALE_CHECK_INTERVAL,
                    shutdown.clone(),
                )
                .await;
            match exit {
                CaptureExit::Shutdown => Ok(()),
                CaptureExit::SourceClosed => Err(BridgeError::CaptureSource(
                    "input ended".to_string(),
                )),
            }
        }
    };

    // Stop the worker (final flush happens inside) and then the connection
    publisher_shutdown.cancel();
    if let Err(e) = worker_task.await {
        warn!("Publisher task failed: {}", e);
    }
    bus.disconnect().await;
    if tokio::time::timeout(DISCONNECT_TIMEOUT, connection_task)
        .await
        .is_err()
    {
        warn!("MQTT connection did not close within {:?}", DISCONNECT_TIMEOUT);
    }

    outcome
}

fn open_acquisition(config: &Config) -> Result<Acquisition> {
    let acquisition = &config.acquisition;
    match acquisition.mode {
        AcquisitionMode::Query => {
            let locator = DeviceLocator::new(
                &acquisition.sysfs_root,
                model_table(&acquisition.extra_devices),
            );
            let table = HandleTable::new(config.sensors.iter().map(|s| s.id.clone()).collect());
            Ok(Acquisition::Query(QueryMode::new(
                locator,
                Arc::new(HidrawTransport::new()),
                table,
                acquisition.exchange_timeout(),
            )))
        }
        AcquisitionMode::Capture => {
            let table = IntervalTable::new(
                config
                    .sensors
                    .iter()
                    .filter_map(|s| s.interval_secs.map(|secs| (secs, s.id.clone()))),
            );
            let (tx, lines) = mpsc::channel(LINE_QUEUE_DEPTH);
            let source = CaptureSource::parse(&acquisition.capture_source, acquisition.capture_grab);
            // The reader thread is detached: a blocked read cannot be joined
            let _reader = capture::spawn_reader(source, tx)?;
            Ok(Acquisition::Capture { lines, table })
        }
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
        }
        _ = async {
            match terminate.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => {}
    }

    info!("Received shutdown signal");
    shutdown.cancel();
}
