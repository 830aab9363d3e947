//! Core types and traits for the TSQ protocol
//!
//! This module contains the fundamental building blocks used throughout the library.

use std::time::Duration;

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{ClockError, Error, ProbeError, Result, TlvError};
pub use self::types::{
    ClientConfig,
    Grouping,
    ProbeMode,
    ServerConfig,
    Target,
};

/// Application protocol tag negotiated on the secure transport
pub const ALPN_TSQ: &[u8] = b"tsq/1";

/// Default server port
pub const DEFAULT_PORT: u16 = 443;

/// Default number of probes per server
pub const DEFAULT_PROBE_COUNT: usize = 5;

/// Upper bound on probes per server
pub const MAX_PROBES: usize = 100;

/// Default response timeout for a single probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on request padding
pub const MAX_PADDING: usize = 1024;

/// How long a server waits on a silent connection before closing it
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest offset the Linux kernel PLL will slew in one call
pub const MAX_SLEW_MS: f64 = 500.0;
