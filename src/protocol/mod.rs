//! Protocol implementation module
//!
//! This module defines the TSQ wire format: TLV records, the 8-byte wire
//! timestamp, and the request/response messages built from them.
//!
//! A request is a single 16-byte nonce record, optionally followed by padding
//! records. A response carries exactly three records in any order: the nonce
//! echo, the server receive timestamp (t2) and the server send timestamp (t3).

pub mod codec;
pub mod message;
pub mod timestamp;
pub mod tlv;

pub use self::codec::TlvCodec;
pub use self::message::{generate_nonce, Nonce, Request, Response, NONCE_LEN};
pub use self::timestamp::{Timestamp, WireTimestamp};
pub use self::tlv::Tlv;

/// Largest request or response a peer needs to buffer
pub const MAX_MESSAGE_SIZE: usize = 2048;
