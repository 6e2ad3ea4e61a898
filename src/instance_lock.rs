//! Single instance lock.
//!
//! Two bridges polling the same hidraw nodes (or grabbing the same keyboard
//! device) would steal each other's reports, so only one may run. The lock is
//! a bound Unix socket, which the OS releases when the process dies.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SOCKET_NAME: &str = "hid-climate-bridge.sock";

#[derive(Debug, Error)]
pub enum InstanceLockError {
    #[error("another bridge instance is already running (lock at {0})")]
    AlreadyRunning(PathBuf),

    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// Held for the lifetime of the process; the socket file is removed on drop.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire() -> Result<Self, InstanceLockError> {
        Self::acquire_at(Self::socket_path())
    }

    pub fn acquire_at(path: PathBuf) -> Result<Self, InstanceLockError> {
        // A socket nobody answers on was left behind by a killed process
        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(InstanceLockError::AlreadyRunning(path));
            }
            let _ = std::fs::remove_file(&path);
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                Err(InstanceLockError::AlreadyRunning(path))
            }
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    /// `$XDG_RUNTIME_DIR/hid-climate-bridge.sock`, or under `/tmp`.
    pub fn socket_path() -> PathBuf {
        Self::socket_path_in(std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from))
    }

    /// Lock socket inside `runtime_dir`, falling back to `/tmp`.
    pub fn socket_path_in(runtime_dir: Option<PathBuf>) -> PathBuf {
        runtime_dir
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(SOCKET_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
