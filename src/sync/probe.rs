use std::time::Duration;

use tracing::debug;

use crate::core::ProbeError;
use crate::network::{ChannelReceiver, ChannelSender};
use crate::protocol::timestamp::{self, Timestamp};
use crate::protocol::{Request, Response};

const NANOS_PER_MS: f64 = 1_000_000.0;

/// One completed four-timestamp exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Server the sample was taken from
    pub server: String,
    /// Round-trip time excluding server processing
    pub rtt_ms: f64,
    /// Server clock minus local clock; positive when the local clock is behind
    pub offset_ms: f64,
    /// Client send
    pub t1: Timestamp,
    /// Server receive
    pub t2: Timestamp,
    /// Server send
    pub t3: Timestamp,
    /// Client receive
    pub t4: Timestamp,
}

impl Sample {
    /// Computes offset and round-trip time from the four timestamps.
    ///
    /// `rtt = (t4 - t1) - (t3 - t2)`, `offset = ((t2 - t1) + (t3 - t4)) / 2`,
    /// evaluated in integer nanoseconds before converting to milliseconds.
    pub fn from_timestamps(
        server: impl Into<String>,
        t1: Timestamp,
        t2: Timestamp,
        t3: Timestamp,
        t4: Timestamp,
    ) -> Self {
        let rtt_ns = t4.nanos_since(t1) - t3.nanos_since(t2);
        let offset_ns_x2 = t2.nanos_since(t1) + t3.nanos_since(t4);

        Sample {
            server: server.into(),
            rtt_ms: rtt_ns as f64 / NANOS_PER_MS,
            offset_ms: offset_ns_x2 as f64 / (2.0 * NANOS_PER_MS),
            t1,
            t2,
            t3,
            t4,
        }
    }
}

/// Per-probe settings
#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    /// How long to wait for the response
    pub timeout: Duration,
    /// Padding bytes appended to the request
    pub padding: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            timeout: crate::core::DEFAULT_PROBE_TIMEOUT,
            padding: 0,
        }
    }
}

/// Performs exactly one request/response exchange on an open channel.
///
/// t1 is taken after the request is serialized, right before it is handed to
/// the transport; t4 as soon as the response bytes arrive, before parsing.
pub async fn exchange(
    sender: &mut dyn ChannelSender,
    receiver: &mut dyn ChannelReceiver,
    server: &str,
    options: &ProbeOptions,
) -> Result<Sample, ProbeError> {
    let request = Request::new().padded(options.padding);
    let bytes = request
        .encode()
        .map_err(|e| ProbeError::Transport(format!("failed to encode request: {}", e)))?;

    let t1 = timestamp::now();
    sender.send(&bytes).await?;
    let reply = receiver.receive(options.timeout).await?;
    let t4 = timestamp::now();

    let response = Response::parse(&reply)?;
    if response.nonce_echo[..] != request.nonce[..] {
        return Err(ProbeError::NonceMismatch);
    }

    let t2 = response.receive.to_timestamp_near(t1);
    let t3 = response.transmit.to_timestamp_near(t1);
    let sample = Sample::from_timestamps(server, t1, t2, t3, t4);

    debug!(
        server,
        offset_ms = sample.offset_ms,
        rtt_ms = sample.rtt_ms,
        "probe complete"
    );
    Ok(sample)
}
