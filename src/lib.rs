//! TSQ: Time Synchronization over a secure transport
//!
//! This library measures the offset between the local clock and one or more
//! time servers using NTP's four-timestamp exchange, carried as TLV records
//! over an authenticated, encrypted channel, and optionally applies the
//! result to the system clock by slewing or stepping it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tsq::{platform_clock, ClientConfig, SyncSession, Target, TlsConnector, TlsOptions};
//!
//! # async fn run() -> tsq::Result<()> {
//! let config = ClientConfig {
//!     targets: vec![Target::new("time.example", 443)],
//!     dry_run: true,
//!     ..Default::default()
//! };
//! let connector = Arc::new(TlsConnector::new(&TlsOptions::default())?);
//! let session = SyncSession::new(config, connector, Arc::from(platform_clock()))?;
//! match session.run().await {
//!     Ok(report) => println!("offset {:.3}ms", report.offset_ms),
//!     Err(failure) => eprintln!("{}", failure),
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod core;
pub mod network;
pub mod protocol;
pub mod server;
pub mod sync;

// Re-export commonly used items
pub use crate::clock::{platform_clock, AdjustMode, AdjustmentDecision, AdjustmentPolicy, ClockAdjuster};
pub use crate::core::{ClientConfig, Error, Result, ServerConfig, Target};
pub use crate::network::{MemoryConnector, TlsConnector, TlsOptions};
pub use crate::server::{Responder, Server};
pub use crate::sync::{AggregationResult, Sample, SyncFailure, SyncReport, SyncSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
