use std::io;
use thiserror::Error;

/// Failures of the TLV codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlvError {
    #[error("TLV value too large: {0} bytes (max 255)")]
    ValueTooLarge(usize),

    #[error("TLV truncated at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Per-probe failures. These are transient: the aggregator records and skips them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("timed out waiting for response")]
    Timeout,

    #[error("empty response")]
    EmptyResponse,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("nonce echo does not match request")]
    NonceMismatch,

    #[error("response lacks {0} timestamp")]
    MissingTimestamp(&'static str),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Failures of the OS clock primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("permission denied adjusting the system clock (requires root)")]
    PermissionDenied,

    #[error("clock adjustment is not supported on this platform")]
    UnsupportedPlatform,

    #[error("slew of {offset_us}us exceeds the kernel limit of {max_us}us")]
    SlewOutOfRange { offset_us: i64, max_us: i64 },

    #[error("clock adjustment failed: OS error {0}")]
    Os(i32),
}

/// Custom error types for TSQ
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLV error: {0}")]
    Tlv(#[from] TlvError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("no valid measurements from {target} ({failures} of {attempts} probes failed)")]
    NoValidMeasurements {
        target: String,
        attempts: usize,
        failures: usize,
    },

    #[error("offset {offset_ms:.3}ms from {target} exceeds the {max_offset_ms}ms safety bound")]
    OffsetOutOfRange {
        target: String,
        offset_ms: f64,
        max_offset_ms: f64,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Creates a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether this error ends synchronization for a target, as opposed to
    /// a single skipped probe.
    pub fn is_target_fatal(&self) -> bool {
        matches!(
            self,
            Error::NoValidMeasurements { .. } | Error::OffsetOutOfRange { .. }
        )
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}
