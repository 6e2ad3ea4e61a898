use thiserror::Error as ThisError;

/// Failure of a single query/response exchange with a HID device.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Device present but did not answer within the timeout.
    #[error("device not ready: {0}")]
    NotReady(String),

    /// Handle no longer valid, the device must be re-discovered.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// Response frame had the wrong size.
    #[error("malformed response: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame does not match device signature: {0}")]
    PatternMismatch(String),

    #[error("frame failed range/checksum check: {0}")]
    ChecksumOrRangeFailure(String),
}

#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum ValidationRejection {
    #[error("{quantity} {value} outside [{min}, {max}]")]
    OutOfRange {
        quantity: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("timestamp {captured_at} precedes last accepted reading at {last}")]
    NonMonotonicTimestamp {
        captured_at: chrono::DateTime<chrono::Utc>,
        last: chrono::DateTime<chrono::Utc>,
    },
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("message bus unavailable: {0}")]
    BusUnavailable(String),
}

/// A reading carried a provenance marker with no configured sensor.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("no sensor configured for {0}")]
pub struct UnknownProvenance(pub String);

/// Everything that can go wrong for one sensor in one cycle.
///
/// All variants count as one consecutive error for the sensor.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Validation(#[from] ValidationRejection),

    #[error("no reading within {0:?}")]
    Stale(std::time::Duration),
}

#[derive(ThisError, Debug)]
pub enum ConfigError {
    #[error("no sensors configured")]
    NoSensors,

    #[error("duplicate sensor id: {0}")]
    DuplicateSensor(String),

    #[error("interval {0}S mapped to more than one sensor")]
    DuplicateInterval(u32),

    #[error("sensor {0} has no interval marker (required in capture mode)")]
    MissingInterval(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid bounds: {0}")]
    InvalidBounds(String),
}

/// Process-fatal errors reported from `main`.
#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("capture source unavailable: {0}")]
    CaptureSource(String),

    #[error(transparent)]
    InstanceLock(#[from] crate::instance_lock::InstanceLockError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
