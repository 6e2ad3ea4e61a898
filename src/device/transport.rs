//! Query/response exchange with a HID sensor.

use super::locator::SensorHandle;
use crate::error::TransportError;
use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::time::{Duration, Instant};

/// Bytes returned by one exchange.
pub type RawFrame = Vec<u8>;

/// Transport for device exchanges.
///
/// `transact` is the only blocking operation in the acquisition path and
/// must never block longer than `timeout`.
pub trait Transport: Send + Sync {
    /// One attempt: send `query`, wait for a `response_len` byte report.
    fn transact(
        &self,
        handle: &SensorHandle,
        query: &[u8],
        response_len: usize,
        timeout: Duration,
    ) -> Result<RawFrame, TransportError>;

    /// Exchange with a single retry on a wrong-sized response.
    ///
    /// A second malformed response is reported as `NotReady`.
    fn exchange(
        &self,
        handle: &SensorHandle,
        query: &[u8],
        response_len: usize,
        timeout: Duration,
    ) -> Result<RawFrame, TransportError> {
        match self.transact(handle, query, response_len, timeout) {
            Err(TransportError::Malformed { expected, actual }) => {
                warn!(
                    "{}: malformed response ({} bytes, expected {}), retrying",
                    handle.path.display(),
                    actual,
                    expected
                );
                match self.transact(handle, query, response_len, timeout) {
                    Err(TransportError::Malformed { expected, actual }) => {
                        Err(TransportError::NotReady(format!(
                            "repeated malformed response ({} of {} bytes)",
                            actual, expected
                        )))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

/// Linux hidraw transport. Opens the node per exchange so a replugged
/// device is picked up without holding stale descriptors.
#[derive(Debug, Default, Clone, Copy)]
pub struct HidrawTransport;

/// Report buffer; larger than any sensor report so short reads are detectable.
const REPORT_BUF_LEN: usize = 64;

/// Upper bound on stale reports discarded before a query.
const MAX_STALE_REPORTS: usize = 16;

impl HidrawTransport {
    pub fn new() -> Self {
        Self
    }

    /// Non-blocking so no read or write outlives the exchange deadline.
    fn open(handle: &SensorHandle) -> Result<File, TransportError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&handle.path)
            .map_err(|e| map_io_error(handle, e))
    }

    /// Wait until `file` signals one of `events` or `deadline` passes.
    fn wait_for(
        file: &File,
        handle: &SensorHandle,
        events: PollFlags,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let what = if events.contains(PollFlags::POLLOUT) {
                    "write"
                } else {
                    "response"
                };
                return Err(TransportError::NotReady(format!("{} timeout", what)));
            }
            let millis = remaining.as_millis().clamp(1, u16::MAX as u128) as u16;

            let mut fds = [PollFd::new(file.as_fd(), events)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => continue,
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                        return Err(TransportError::Disconnected(format!(
                            "{}: hangup",
                            handle.path.display()
                        )));
                    }
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(map_errno(handle, e)),
            }
        }
    }

    fn send(
        file: &mut File,
        handle: &SensorHandle,
        report: &[u8],
        deadline: Instant,
    ) -> Result<(), TransportError> {
        loop {
            Self::wait_for(file, handle, PollFlags::POLLOUT, deadline)?;
            match file.write(report) {
                Ok(n) if n == report.len() => return Ok(()),
                Ok(n) => {
                    return Err(TransportError::NotReady(format!(
                        "short write ({} of {} bytes)",
                        n,
                        report.len()
                    )));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(map_io_error(handle, e)),
            }
        }
    }

    fn receive(
        file: &mut File,
        handle: &SensorHandle,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<usize, TransportError> {
        loop {
            Self::wait_for(file, handle, PollFlags::POLLIN, deadline)?;
            match file.read(buf) {
                Ok(n) => return Ok(n),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(map_io_error(handle, e)),
            }
        }
    }
}

/// Read and drop reports already queued on a non-blocking `reader`, so the
/// next read returns the answer to the next query.
///
/// Returns the number of reports dropped.
fn discard_queued(reader: &mut impl Read) -> io::Result<usize> {
    let mut buf = [0u8; REPORT_BUF_LEN];
    let mut dropped = 0;
    while dropped < MAX_STALE_REPORTS {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => dropped += 1,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(dropped)
}

impl Transport for HidrawTransport {
    fn transact(
        &self,
        handle: &SensorHandle,
        query: &[u8],
        response_len: usize,
        timeout: Duration,
    ) -> Result<RawFrame, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut file = Self::open(handle)?;

        let stale = discard_queued(&mut file).map_err(|e| map_io_error(handle, e))?;
        if stale > 0 {
            debug!("{}: dropped {} stale report(s)", handle.path.display(), stale);
        }

        // hidraw expects the report id first; these devices use unnumbered reports
        let mut report = Vec::with_capacity(query.len() + 1);
        report.push(0u8);
        report.extend_from_slice(query);
        Self::send(&mut file, handle, &report, deadline)?;

        let mut buf = [0u8; REPORT_BUF_LEN];
        let n = Self::receive(&mut file, handle, &mut buf, deadline)?;
        debug!("{}: read {} bytes {:02x?}", handle.path.display(), n, &buf[..n]);

        if n != response_len {
            return Err(TransportError::Malformed {
                expected: response_len,
                actual: n,
            });
        }
        Ok(buf[..n].to_vec())
    }
}

fn map_io_error(handle: &SensorHandle, e: io::Error) -> TransportError {
    match e.raw_os_error() {
        Some(code) => map_errno(handle, Errno::from_raw(code)),
        None if e.kind() == io::ErrorKind::NotFound => {
            TransportError::Disconnected(format!("{}: {}", handle.path.display(), e))
        }
        None => TransportError::NotReady(format!("{}: {}", handle.path.display(), e)),
    }
}

fn map_errno(handle: &SensorHandle, errno: Errno) -> TransportError {
    let detail = format!("{}: {}", handle.path.display(), errno.desc());
    match errno {
        Errno::ENOENT | Errno::ENODEV | Errno::ENXIO | Errno::EPIPE => {
            TransportError::Disconnected(detail)
        }
        _ => TransportError::NotReady(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockTransport, handle};
    use std::collections::VecDeque;

    /// Non-blocking reader with `queued` reports waiting.
    struct QueuedReports {
        queued: VecDeque<Vec<u8>>,
        reads: usize,
    }

    impl QueuedReports {
        fn new(queued: impl IntoIterator<Item = Vec<u8>>) -> Self {
            Self {
                queued: queued.into_iter().collect(),
                reads: 0,
            }
        }
    }

    impl Read for QueuedReports {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.queued.pop_front() {
                Some(report) => {
                    buf[..report.len()].copy_from_slice(&report);
                    Ok(report.len())
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Device that always has another report ready.
    struct Chatty;

    impl Read for Chatty {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf[..8].fill(0x80);
            Ok(8)
        }
    }

    #[test]
    fn test_missing_node_is_disconnected() {
        let h = handle(0, "/nonexistent/hidraw99");
        let err = HidrawTransport::new()
            .transact(&h, &[0u8; 8], 8, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
    }

    #[test]
    fn test_single_malformed_is_retried() {
        let mock = MockTransport::new();
        mock.push(Err(TransportError::Malformed {
            expected: 8,
            actual: 3,
        }));
        mock.push(Ok(vec![0x80; 8]));

        let frame = mock
            .exchange(&handle(0, "/dev/hidraw0"), &[0; 8], 8, Duration::from_millis(10))
            .unwrap();
        assert_eq!(frame, vec![0x80; 8]);
        assert_eq!(mock.calls(), 2);
    }

    #[test]
    fn test_repeated_malformed_becomes_not_ready() {
        let mock = MockTransport::new();
        for _ in 0..2 {
            mock.push(Err(TransportError::Malformed {
                expected: 8,
                actual: 3,
            }));
        }

        let err = mock
            .exchange(&handle(0, "/dev/hidraw0"), &[0; 8], 8, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, TransportError::NotReady(_)));
        assert_eq!(mock.calls(), 2);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mock = MockTransport::new();
        mock.push(Err(TransportError::Disconnected("gone".into())));

        let err = mock
            .exchange(&handle(0, "/dev/hidraw0"), &[0; 8], 8, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn test_queued_response_is_dropped_before_query() {
        // An answer left over from an abandoned exchange
        let mut reader = QueuedReports::new([vec![0x80, 0x80, 0x08, 0x34, 0x0f, 0xa0, 0, 0]]);
        assert_eq!(discard_queued(&mut reader).unwrap(), 1);
        assert!(reader.queued.is_empty());
        assert_eq!(reader.reads, 2);
    }

    #[test]
    fn test_nothing_queued_drops_nothing() {
        let mut reader = QueuedReports::new(Vec::new());
        assert_eq!(discard_queued(&mut reader).unwrap(), 0);
        assert_eq!(reader.reads, 1);
    }

    #[test]
    fn test_discard_is_bounded() {
        assert_eq!(discard_queued(&mut Chatty).unwrap(), MAX_STALE_REPORTS);
    }
}
