//! Diagnostic tool for sensor hardware and captured text.
//!
//! Usage:
//!   cargo run --bin sensor-probe -- list
//!   cargo run --bin sensor-probe -- query --count 3
//!   some-capture-command | cargo run --bin sensor-probe -- parse
//!
//! Reads the same environment (and `.env`) as the bridge but never touches
//! the message bus.

use clap::{Parser, Subcommand};
use hid_climate_bridge::config::{self, Config};
use hid_climate_bridge::decode::{ParsedLine, decode_frame, parse_line};
use hid_climate_bridge::device::{DeviceLocator, HidrawTransport, SensorHandle, Transport, model_table};
use hid_climate_bridge::sensors::{Disambiguator, IntervalTable, Provenance};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sensor-probe")]
#[command(about = "Inspect HID climate sensors without publishing anything")]
struct Cli {
    /// hidraw class directory in sysfs
    #[arg(long, env = "HIDRAW_SYSFS_ROOT")]
    sysfs_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached sensors in enumeration order
    List,
    /// Query every attached sensor and print the decoded values
    Query {
        /// Number of rounds
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Pause between rounds in milliseconds
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },
    /// Classify lines read from stdin and show which sensor each maps to
    Parse,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::load_dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let sysfs_root = cli
        .sysfs_root
        .unwrap_or_else(|| config.acquisition.sysfs_root.clone());
    let locator = DeviceLocator::new(sysfs_root, model_table(&config.acquisition.extra_devices));

    match cli.command {
        Commands::List => {
            let handles = locator.discover();
            if handles.is_empty() {
                println!("No sensors found");
            }
            for (index, handle) in handles.iter().enumerate() {
                print_handle(index, handle);
            }
        }
        Commands::Query { count, interval_ms } => {
            let transport = HidrawTransport::new();
            let timeout = config.acquisition.exchange_timeout();
            for round in 0..count {
                if round > 0 {
                    std::thread::sleep(Duration::from_millis(interval_ms));
                }
                let handles = locator.discover();
                if handles.is_empty() {
                    println!("No sensors found");
                }
                for (index, handle) in handles.iter().enumerate() {
                    query_once(&transport, index, handle, timeout);
                }
            }
        }
        Commands::Parse => {
            let table = IntervalTable::new(
                config
                    .sensors
                    .iter()
                    .filter_map(|s| s.interval_secs.map(|secs| (secs, s.id.clone()))),
            );
            for line in std::io::stdin().lock().lines() {
                let line = line?;
                println!("{:<40} {}", format!("{:?}", line), classify(&line, &table));
            }
        }
    }

    Ok(())
}

fn print_handle(index: usize, handle: &SensorHandle) {
    println!(
        "#{} {} {} [{}] {}",
        index,
        handle.path.display(),
        handle.model.id,
        handle.model.name,
        handle.phys
    );
}

fn query_once(transport: &dyn Transport, index: usize, handle: &SensorHandle, timeout: Duration) {
    let layout = handle.model.layout;
    let result = transport
        .exchange(handle, &handle.model.query, layout.frame_len, timeout)
        .map_err(|e| e.to_string())
        .and_then(|frame| {
            let hex: Vec<String> = frame.iter().map(|b| format!("{:02x}", b)).collect();
            decode_frame(&frame, &layout)
                .map(|m| (m, hex.join(" ")))
                .map_err(|e| format!("{} (frame {})", e, hex.join(" ")))
        });

    match result {
        Ok((m, hex)) => println!(
            "#{} {}: {:.2}°C {:.2}%  [{}]",
            index,
            handle.path.display(),
            m.temperature_celsius,
            m.humidity_percent,
            hex
        ),
        Err(e) => println!("#{} {}: error: {}", index, handle.path.display(), e),
    }
}

fn classify(line: &str, table: &IntervalTable) -> String {
    match parse_line(line) {
        ParsedLine::Reading {
            measurement,
            interval_secs,
        } => {
            let target = match table.assign(&Provenance::Interval(interval_secs)) {
                Ok(id) => format!("-> {}", id),
                Err(e) => format!("discarded ({})", e),
            };
            format!(
                "reading {:.2}°C {:.2}% {}S {}",
                measurement.temperature_celsius, measurement.humidity_percent, interval_secs, target
            )
        }
        ParsedLine::Banner(text) => format!("banner {:?}", text),
        ParsedLine::Unrecognized(_) => "unrecognized".to_string(),
    }
}
