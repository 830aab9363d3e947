//! Transport seam between the synchronization engine and the secure channel
//!
//! The engine only ever sees the four traits below. A [`Connector`] resolves a
//! [`Target`] into a [`Connection`]; every probe opens a fresh bidirectional
//! channel on that connection, sends one request and awaits one response.

mod memory;
mod stream;
pub mod tls;

pub use self::memory::MemoryConnector;
pub use self::stream::{stream_channel, StreamReceiver, StreamSender};
pub use self::tls::{TlsConnector, TlsOptions};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::{ProbeError, Result, Target};

/// Outcome of a channel operation. Channel failures are per-probe failures.
pub type ChannelResult<T> = std::result::Result<T, ProbeError>;

/// Opens connections to time servers
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves and prepares a connection to `target`
    async fn open(&self, target: &Target) -> Result<Box<dyn Connection>>;
}

/// An established path to one server
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new bidirectional channel for a single exchange
    async fn open_channel(&self) -> ChannelResult<(Box<dyn ChannelSender>, Box<dyn ChannelReceiver>)>;

    /// Human-readable identity of the remote peer
    fn peer(&self) -> String;
}

/// Sending half of a channel
#[async_trait]
pub trait ChannelSender: Send {
    /// Writes `bytes` and flushes them to the peer
    async fn send(&mut self, bytes: &[u8]) -> ChannelResult<()>;
}

/// Receiving half of a channel
#[async_trait]
pub trait ChannelReceiver: Send {
    /// Waits up to `timeout` for the peer's message. An empty result means the
    /// peer closed the channel without answering.
    async fn receive(&mut self, timeout: Duration) -> ChannelResult<Bytes>;
}

pub(crate) fn transport_error(e: impl std::fmt::Display) -> ProbeError {
    ProbeError::Transport(e.to_string())
}
