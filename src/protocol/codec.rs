use bytes::BytesMut;
use tokio_util::codec::Encoder;

use crate::core::Error;
use super::tlv::{self, Tlv};

/// Frame encoder for TLV records
///
/// Each encoded record is appended to the destination buffer, so a message is
/// built by encoding its records in wire order.
#[derive(Clone, Debug, Default)]
pub struct TlvCodec;

impl TlvCodec {
    /// Creates a new TLV codec
    pub fn new() -> Self {
        TlvCodec
    }
}

impl Encoder<Tlv> for TlvCodec {
    type Error = Error;

    fn encode(&mut self, item: Tlv, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tlv::encode_into(dst, item.tlv_type, &item.value)?;
        Ok(())
    }
}
