//! Type-Length-Value records
//!
//! Every TSQ message is a concatenation of records `{type: u8, length: u8,
//! value: [u8; length]}` with no padding between them. Unknown types are
//! preserved on decode so newer peers can add records.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::TlvError;

/// Nonce (request) or nonce echo (response)
pub const TLV_NONCE: u8 = 1;
/// Server receive timestamp
pub const TLV_RECV_TIMESTAMP: u8 = 2;
/// Server send timestamp
pub const TLV_SEND_TIMESTAMP: u8 = 3;
/// Filler for payload-size experiments, ignored by receivers
pub const TLV_PADDING: u8 = 254;

/// Size of the type and length fields
pub const HEADER_LEN: usize = 2;
/// Largest value a single record can carry
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

/// A decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u8,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tlv_type: u8, value: impl Into<Bytes>) -> Self {
        Tlv {
            tlv_type,
            value: value.into(),
        }
    }
}

/// Encodes a single record
pub fn encode(tlv_type: u8, value: &[u8]) -> Result<Bytes, TlvError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + value.len());
    encode_into(&mut buf, tlv_type, value)?;
    Ok(buf.freeze())
}

/// Appends a single record to `dst`
pub fn encode_into(dst: &mut BytesMut, tlv_type: u8, value: &[u8]) -> Result<(), TlvError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(TlvError::ValueTooLarge(value.len()));
    }
    dst.reserve(HEADER_LEN + value.len());
    dst.put_u8(tlv_type);
    dst.put_u8(value.len() as u8);
    dst.put_slice(value);
    Ok(())
}

/// Decodes every record in `buf`, in order.
///
/// Fails with [`TlvError::Truncated`] if a header or value runs past the end
/// of the buffer. An empty buffer decodes to an empty list.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Tlv>, TlvError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let len = record_len(buf, offset)?;
        let value = &buf[offset + HEADER_LEN..offset + len];
        records.push(Tlv::new(buf[offset], Bytes::copy_from_slice(value)));
        offset += len;
    }

    Ok(records)
}

/// Whether `buf` ends inside a record, i.e. more bytes are needed to finish it.
pub fn is_incomplete(buf: &[u8]) -> bool {
    let mut offset = 0;
    while offset < buf.len() {
        match record_len(buf, offset) {
            Ok(len) => offset += len,
            Err(_) => return true,
        }
    }
    false
}

/// Full length of the record starting at `offset`, checked against `buf`.
fn record_len(buf: &[u8], offset: usize) -> Result<usize, TlvError> {
    let available = buf.len() - offset;
    if available < HEADER_LEN {
        return Err(TlvError::Truncated {
            offset,
            needed: HEADER_LEN,
            available,
        });
    }
    let len = HEADER_LEN + buf[offset + 1] as usize;
    if available < len {
        return Err(TlvError::Truncated {
            offset,
            needed: len,
            available,
        });
    }
    Ok(len)
}
