use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;
use tracing::debug;

use crate::core::Result;
use crate::protocol::timestamp::{self, Timestamp, WIRE_LEN};
use crate::protocol::tlv::{TLV_NONCE, TLV_RECV_TIMESTAMP, TLV_SEND_TIMESTAMP};
use crate::protocol::{Request, Tlv, TlvCodec, NONCE_LEN};

type ClockFn = dyn Fn() -> Timestamp + Send + Sync;

const RESPONSE_LEN: usize = 3 * 2 + NONCE_LEN + 2 * WIRE_LEN;

/// Answers time requests. Holds no per-client state.
#[derive(Clone)]
pub struct Responder {
    clock: Arc<ClockFn>,
}

impl Responder {
    /// Creates a responder stamping with the system clock
    pub fn new() -> Self {
        Responder::with_clock(timestamp::now)
    }

    /// Creates a responder stamping with a custom clock
    pub fn with_clock(clock: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        Responder {
            clock: Arc::new(clock),
        }
    }

    /// Reads the responder's clock. Callers take t2 with this the moment
    /// request bytes arrive.
    pub fn now(&self) -> Timestamp {
        (self.clock)()
    }

    /// Builds the reply to `request`, received at `received_at` from `peer`.
    ///
    /// Returns `None` for requests that must be dropped without an answer.
    pub fn handle(&self, request: &[u8], received_at: Timestamp, peer: &str) -> Option<Bytes> {
        let request = match Request::parse(request) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer, len = request.len(), error = %e, "dropping invalid request");
                return None;
            }
        };

        match self.build_response(&request, received_at) {
            Ok(response) => {
                debug!(peer, padding = request.padding, "answered time request");
                Some(response)
            }
            Err(e) => {
                debug!(peer, error = %e, "failed to build response");
                None
            }
        }
    }

    fn build_response(&self, request: &Request, received_at: Timestamp) -> Result<Bytes> {
        let mut codec = TlvCodec::new();
        let mut buf = BytesMut::with_capacity(RESPONSE_LEN);

        codec.encode(Tlv::new(TLV_NONCE, Bytes::copy_from_slice(&request.nonce)), &mut buf)?;
        codec.encode(wire_record(TLV_RECV_TIMESTAMP, received_at), &mut buf)?;
        // t3 as late as possible
        codec.encode(wire_record(TLV_SEND_TIMESTAMP, self.now()), &mut buf)?;

        Ok(buf.freeze())
    }
}

fn wire_record(tlv_type: u8, ts: Timestamp) -> Tlv {
    Tlv::new(tlv_type, Bytes::copy_from_slice(&timestamp::encode(ts)))
}

impl Default for Responder {
    fn default() -> Self {
        Responder::new()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}
