use bytes::{Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::core::{Error, ProbeError, Result};
use super::timestamp::{WireTimestamp, WIRE_LEN};
use super::tlv::{self, TLV_NONCE, TLV_PADDING, TLV_RECV_TIMESTAMP, TLV_SEND_TIMESTAMP};

/// Length of the request nonce
pub const NONCE_LEN: usize = 16;

/// Single-use value binding a response to its request
pub type Nonce = [u8; NONCE_LEN];

/// Draws a fresh nonce from the operating system's CSPRNG
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// A time request: one nonce record, optionally followed by padding records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub nonce: Nonce,
    /// Total padding bytes, carried in as many padding records as needed
    pub padding: usize,
}

impl Request {
    /// Creates a request with a fresh random nonce
    pub fn new() -> Self {
        Request::with_nonce(generate_nonce())
    }

    pub fn with_nonce(nonce: Nonce) -> Self {
        Request { nonce, padding: 0 }
    }

    pub fn padded(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Serializes the request
    pub fn encode(&self) -> Result<Bytes> {
        let records = 1 + self.padding.div_ceil(tlv::MAX_VALUE_LEN);
        let mut buf = BytesMut::with_capacity(NONCE_LEN + self.padding + records * tlv::HEADER_LEN);
        tlv::encode_into(&mut buf, TLV_NONCE, &self.nonce)?;

        let filler = [0u8; tlv::MAX_VALUE_LEN];
        let mut remaining = self.padding;
        while remaining > 0 {
            let chunk = remaining.min(tlv::MAX_VALUE_LEN);
            tlv::encode_into(&mut buf, TLV_PADDING, &filler[..chunk])?;
            remaining -= chunk;
        }
        Ok(buf.freeze())
    }

    /// Parses a request as a server receives it.
    ///
    /// The nonce record must come first and be exactly 16 bytes; anything that
    /// follows it must still be well-formed TLV.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < tlv::HEADER_LEN + NONCE_LEN {
            return Err(Error::protocol(format!("request too short: {} bytes", buf.len())));
        }
        let records = tlv::decode_all(buf)?;
        let first = &records[0];
        if first.tlv_type != TLV_NONCE || first.value.len() != NONCE_LEN {
            return Err(Error::protocol(format!(
                "expected 16-byte nonce record, got type {} length {}",
                first.tlv_type,
                first.value.len()
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&first.value);
        let padding = records[1..]
            .iter()
            .filter(|r| r.tlv_type == TLV_PADDING)
            .map(|r| r.value.len())
            .sum();
        Ok(Request { nonce, padding })
    }
}

impl Default for Request {
    fn default() -> Self {
        Request::new()
    }
}

/// A server's reply to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The nonce as echoed by the server; compared against the request by the caller
    pub nonce_echo: Bytes,
    /// When the server received the request (t2)
    pub receive: WireTimestamp,
    /// When the server sent the response (t3)
    pub transmit: WireTimestamp,
}

impl Response {
    /// Parses a response. Records may come in any order; unknown records are ignored.
    pub fn parse(buf: &[u8]) -> std::result::Result<Self, ProbeError> {
        if buf.is_empty() {
            return Err(ProbeError::EmptyResponse);
        }
        let records =
            tlv::decode_all(buf).map_err(|e| ProbeError::MalformedResponse(e.to_string()))?;

        let mut nonce_echo = None;
        let mut receive = None;
        let mut transmit = None;

        for record in records {
            let slot = match record.tlv_type {
                TLV_NONCE => {
                    if nonce_echo.replace(record.value).is_some() {
                        return Err(duplicate("nonce"));
                    }
                    continue;
                }
                TLV_RECV_TIMESTAMP => &mut receive,
                TLV_SEND_TIMESTAMP => &mut transmit,
                _ => continue,
            };
            let bytes: [u8; WIRE_LEN] = (&record.value[..]).try_into().map_err(|_| {
                ProbeError::MalformedResponse(format!(
                    "timestamp record type {} has length {}, expected {}",
                    record.tlv_type,
                    record.value.len(),
                    WIRE_LEN
                ))
            })?;
            if slot.replace(WireTimestamp::from_bytes(bytes)).is_some() {
                return Err(duplicate("timestamp"));
            }
        }

        let nonce_echo = nonce_echo
            .ok_or_else(|| ProbeError::MalformedResponse("missing nonce echo".into()))?;
        Ok(Response {
            nonce_echo,
            receive: receive.ok_or(ProbeError::MissingTimestamp("receive"))?,
            transmit: transmit.ok_or(ProbeError::MissingTimestamp("send"))?,
        })
    }
}

fn duplicate(what: &str) -> ProbeError {
    ProbeError::MalformedResponse(format!("duplicate {} record", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(tlv_type: u8, value: &[u8]) -> Vec<u8> {
        tlv::encode(tlv_type, value).unwrap().to_vec()
    }

    #[test]
    fn test_nonces_are_fresh() {
        assert_ne!(generate_nonce(), generate_nonce());
        assert_ne!(Request::new().nonce, Request::new().nonce);
    }

    #[test]
    fn test_request_encoding() {
        let request = Request::with_nonce([5; 16]);
        let bytes = request.encode().unwrap();
        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[..2], &[TLV_NONCE, 16]);
        assert_eq!(Request::parse(&bytes).unwrap(), request);
    }

    #[test]
    fn test_request_padding_spans_records() {
        let request = Request::with_nonce([5; 16]).padded(600);
        let bytes = request.encode().unwrap();
        // 255 + 255 + 90 bytes of padding, each with its own header
        assert_eq!(bytes.len(), 18 + 600 + 3 * 2);
        let parsed = Request::parse(&bytes).unwrap();
        assert_eq!(parsed.padding, 600);
        assert_eq!(parsed.nonce, [5; 16]);
    }

    #[test]
    fn test_request_rejections() {
        assert!(Request::parse(&[]).is_err());
        assert!(Request::parse(&[TLV_NONCE, 16, 0, 0]).is_err());

        let wrong_type = rec(TLV_PADDING, &[0; 16]);
        assert!(Request::parse(&wrong_type).is_err());

        let wrong_len = rec(TLV_NONCE, &[0; 20]);
        assert!(Request::parse(&wrong_len).is_err());

        let mut trailing_garbage = Request::with_nonce([1; 16]).encode().unwrap().to_vec();
        trailing_garbage.push(TLV_PADDING);
        assert!(Request::parse(&trailing_garbage).is_err());
    }

    #[test]
    fn test_response_any_order() {
        let t2 = [0, 0, 0, 1, 0, 0, 0, 2];
        let t3 = [0, 0, 0, 3, 0, 0, 0, 4];
        let bytes = [
            rec(TLV_SEND_TIMESTAMP, &t3),
            rec(99, b"ext"),
            rec(TLV_NONCE, &[8; 16]),
            rec(TLV_RECV_TIMESTAMP, &t2),
        ]
        .concat();
        let response = Response::parse(&bytes).unwrap();
        assert_eq!(&response.nonce_echo[..], &[8; 16]);
        assert_eq!(response.receive, WireTimestamp { seconds: 1, fraction: 2 });
        assert_eq!(response.transmit, WireTimestamp { seconds: 3, fraction: 4 });
    }

    #[test]
    fn test_response_failures() {
        assert_eq!(Response::parse(&[]), Err(ProbeError::EmptyResponse));

        let missing_t3 = [rec(TLV_NONCE, &[8; 16]), rec(TLV_RECV_TIMESTAMP, &[0; 8])].concat();
        assert_eq!(
            Response::parse(&missing_t3),
            Err(ProbeError::MissingTimestamp("send"))
        );

        let missing_t2 = [rec(TLV_NONCE, &[8; 16]), rec(TLV_SEND_TIMESTAMP, &[0; 8])].concat();
        assert_eq!(
            Response::parse(&missing_t2),
            Err(ProbeError::MissingTimestamp("receive"))
        );

        let short_ts = [
            rec(TLV_NONCE, &[8; 16]),
            rec(TLV_RECV_TIMESTAMP, &[0; 7]),
            rec(TLV_SEND_TIMESTAMP, &[0; 8]),
        ]
        .concat();
        assert!(matches!(
            Response::parse(&short_ts),
            Err(ProbeError::MalformedResponse(_))
        ));

        let doubled = [
            rec(TLV_NONCE, &[8; 16]),
            rec(TLV_RECV_TIMESTAMP, &[0; 8]),
            rec(TLV_RECV_TIMESTAMP, &[0; 8]),
            rec(TLV_SEND_TIMESTAMP, &[0; 8]),
        ]
        .concat();
        assert!(matches!(
            Response::parse(&doubled),
            Err(ProbeError::MalformedResponse(_))
        ));

        assert!(matches!(
            Response::parse(&[TLV_NONCE, 16, 1]),
            Err(ProbeError::MalformedResponse(_))
        ));
    }
}
