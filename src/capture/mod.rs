//! Passive capture of text typed by keyboard-emulating sensors.
//!
//! All sensors type into one shared channel. Exactly one reader thread owns
//! that channel and forwards complete lines through a bounded queue, so
//! partial lines are never raced over by concurrent readers.

use crate::decode::KeystrokeDecoder;
use crate::decode::keystroke::INPUT_EVENT_SIZE;
use crate::error::BridgeError;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Lines buffered between the reader and the supervisor.
pub const LINE_QUEUE_DEPTH: usize = 256;

/// Events read from an evdev node per syscall.
const EVENTS_PER_READ: usize = 64;

nix::ioctl_write_int!(eviocgrab, b'E', 0x90);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// Text arriving on standard input (e.g. piped from a console capture).
    Stdin,
    /// A file or FIFO carrying the typed text.
    File(PathBuf),
    /// A keyboard event node of the sensor itself.
    Evdev { path: PathBuf, grab: bool },
}

impl CaptureSource {
    /// `stdin`, `evdev:<path>`, or any other string as a file path.
    pub fn parse(spec: &str, grab: bool) -> Self {
        let spec = spec.trim();
        if spec.is_empty() || spec == "stdin" || spec == "-" {
            CaptureSource::Stdin
        } else if let Some(path) = spec.strip_prefix("evdev:") {
            CaptureSource::Evdev {
                path: PathBuf::from(path),
                grab,
            }
        } else {
            CaptureSource::File(PathBuf::from(spec))
        }
    }
}

/// Open `source` and start the reader thread.
///
/// Opening happens up front so an unusable source is a startup error rather
/// than a silent dead reader.
pub fn spawn_reader(
    source: CaptureSource,
    tx: mpsc::Sender<String>,
) -> Result<JoinHandle<()>, BridgeError> {
    let thread = std::thread::Builder::new().name("capture-reader".into());

    let handle = match source {
        CaptureSource::Stdin => {
            info!("Capturing sensor text from stdin");
            thread.spawn(move || forward_lines(std::io::stdin().lock(), tx))?
        }
        CaptureSource::File(path) => {
            let file = File::open(&path).map_err(|e| {
                BridgeError::CaptureSource(format!("{}: {}", path.display(), e))
            })?;
            info!("Capturing sensor text from {}", path.display());
            thread.spawn(move || forward_lines(BufReader::new(file), tx))?
        }
        CaptureSource::Evdev { path, grab } => {
            let file = File::open(&path).map_err(|e| {
                BridgeError::CaptureSource(format!("{}: {}", path.display(), e))
            })?;
            if grab {
                // SAFETY: fd is valid for the lifetime of `file`; EVIOCGRAB takes an int flag
                unsafe { eviocgrab(file.as_raw_fd(), 1) }.map_err(|e| {
                    BridgeError::CaptureSource(format!("grab {}: {}", path.display(), e))
                })?;
            }
            info!(
                "Capturing keystrokes from {}{}",
                path.display(),
                if grab { " (exclusive)" } else { "" }
            );
            thread.spawn(move || forward_keystrokes(file, tx))?
        }
    };

    Ok(handle)
}

/// Forward newline-terminated text. Invalid UTF-8 is replaced, not fatal:
/// a corrupted line is for the parser to reject.
pub fn forward_lines<R: BufRead>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                info!("Capture source reached end of input");
                return;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.blocking_send(line).is_err() {
                    debug!("Line queue closed, stopping capture reader");
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Capture source read failed: {}", e);
                return;
            }
        }
    }
}

fn forward_keystrokes(mut device: File, tx: mpsc::Sender<String>) {
    let mut decoder = KeystrokeDecoder::new();
    let mut buf = vec![0u8; INPUT_EVENT_SIZE * EVENTS_PER_READ];
    loop {
        match device.read(&mut buf) {
            Ok(0) => {
                info!("Keyboard device closed");
                return;
            }
            Ok(n) => {
                for line in decoder.feed_bytes(&buf[..n]) {
                    if tx.blocking_send(line).is_err() {
                        debug!("Line queue closed, stopping capture reader");
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Keyboard device read failed: {}", e);
                return;
            }
        }
    }
}
