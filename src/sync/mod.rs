//! Synchronization module
//!
//! This module handles the client side of a run: single probe exchanges,
//! multi-round aggregation with robust statistics, and the session that ties
//! measurement to clock adjustment.

pub mod aggregator;
pub mod probe;
pub mod session;
pub mod stats;

pub use self::aggregator::{AggregationResult, Aggregator, ProbeFailure};
pub use self::probe::{exchange, ProbeOptions, Sample};
pub use self::session::{ServerSummary, Stage, SyncFailure, SyncReport, SyncSession};
