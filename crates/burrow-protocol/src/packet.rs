//! Length-prefixed packets.
//!
//! Wire format: `[u16 BE head length][JSON head][body]`. The encoder injects
//! `bodyLength` into the head so a receiver can tell where the body ends
//! without any outer framing.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

use crate::ProtocolError;

/// Packet head: arbitrary JSON object metadata.
pub type Head = Map<String, Value>;

/// Head key carrying the body length.
pub const BODY_LENGTH_KEY: &str = "bodyLength";

/// Head key carrying the channel of a typed packet.
pub const TYPE_KEY: &str = "type";

pub(crate) const HEAD_PREFIX_SIZE: usize = 2;

/// Heads shorter than this cannot hold a JSON object with a body length and
/// decode as empty.
const MIN_HEAD_SIZE: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub head: Head,
    pub body: Bytes,
}

impl Packet {
    pub fn new(head: Head, body: impl Into<Bytes>) -> Self {
        Self {
            head,
            body: body.into(),
        }
    }

    /// A packet whose head only names its channel.
    pub fn typed(kind: &str, body: impl Into<Bytes>) -> Self {
        let mut head = Head::new();
        head.insert(TYPE_KEY.into(), Value::String(kind.into()));
        Self::new(head, body)
    }

    pub fn kind(&self) -> Option<&str> {
        self.head.get(TYPE_KEY).and_then(Value::as_str)
    }

    pub fn body_length(&self) -> Option<usize> {
        declared_body_length(&self.head)
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut head = self.head.clone();
        head.insert(BODY_LENGTH_KEY.into(), Value::from(self.body.len()));
        let head_bytes = serde_json::to_vec(&head)?;
        if head_bytes.len() > u16::MAX as usize {
            return Err(ProtocolError::HeadTooLarge {
                size: head_bytes.len(),
                max: u16::MAX as usize,
            });
        }

        let mut buf = BytesMut::with_capacity(HEAD_PREFIX_SIZE + head_bytes.len() + self.body.len());
        buf.put_u16(head_bytes.len() as u16);
        buf.extend_from_slice(&head_bytes);
        buf.extend_from_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decode one complete packet. Truncated input, an unparseable head, or a
    /// body that disagrees with the declared `bodyLength` is an error.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let head_len = peek_head_len(buf)?;
        let available = buf.len() - HEAD_PREFIX_SIZE;
        if head_len > available {
            return Err(ProtocolError::Truncated {
                needed: HEAD_PREFIX_SIZE + head_len,
                available: buf.len(),
            });
        }

        let head_end = HEAD_PREFIX_SIZE + head_len;
        let head = parse_head(&buf[HEAD_PREFIX_SIZE..head_end])?;
        let body = Bytes::copy_from_slice(&buf[head_end..]);

        if let Some(declared) = declared_body_length(&head) {
            if declared != body.len() {
                return Err(ProtocolError::LengthMismatch {
                    declared,
                    actual: body.len(),
                });
            }
        }

        Ok(Self { head, body })
    }
}

pub(crate) fn peek_head_len(buf: &[u8]) -> Result<usize, ProtocolError> {
    if buf.len() < HEAD_PREFIX_SIZE {
        return Err(ProtocolError::Truncated {
            needed: HEAD_PREFIX_SIZE,
            available: buf.len(),
        });
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]) as usize)
}

pub(crate) fn parse_head(bytes: &[u8]) -> Result<Head, ProtocolError> {
    if bytes.len() < MIN_HEAD_SIZE {
        return Ok(Head::new());
    }
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(ProtocolError::InvalidHead(format!(
            "expected object, got {}",
            json_kind(&other)
        ))),
    }
}

pub(crate) fn declared_body_length(head: &Head) -> Option<usize> {
    head.get(BODY_LENGTH_KEY)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn head(v: Value) -> Head {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_encode_layout() {
        let p = Packet::new(head(json!({"type": "MESSAGE"})), &b"AB"[..]);
        let buf = p.encode().unwrap();

        let head_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let parsed: Value = serde_json::from_slice(&buf[2..2 + head_len]).unwrap();
        assert_eq!(parsed["type"], "MESSAGE");
        assert_eq!(parsed["bodyLength"], 2);
        assert_eq!(&buf[2 + head_len..], b"AB");
    }

    #[test]
    fn test_decode_roundtrip_with_empty_body() {
        let p = Packet::typed("STATUS", Bytes::new());
        let decoded = Packet::decode(&p.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), Some("STATUS"));
        assert_eq!(decoded.body_length(), Some(0));
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_truncated_prefix() {
        assert!(matches!(
            Packet::decode(&[0x00]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_head_length_exceeds_input() {
        let buf = [0x00, 0x40, b'{', b'}'];
        assert!(matches!(
            Packet::decode(&buf),
            Err(ProtocolError::Truncated { needed: 66, available: 4 })
        ));
    }

    #[test]
    fn test_body_length_mismatch() {
        let mut buf = BytesMut::from(&Packet::typed("MESSAGE", &b"hello"[..]).encode().unwrap()[..]);
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            Packet::decode(&buf),
            Err(ProtocolError::LengthMismatch { declared: 5, actual: 4 })
        ));
    }

    #[test]
    fn test_invalid_head_json() {
        let mut buf = BytesMut::new();
        buf.put_u16(9);
        buf.extend_from_slice(b"{not json");
        assert!(matches!(Packet::decode(&buf), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_non_object_head() {
        let mut buf = BytesMut::new();
        buf.put_u16(9);
        buf.extend_from_slice(b"[1,2,3,4]");
        assert!(matches!(Packet::decode(&buf), Err(ProtocolError::InvalidHead(_))));
    }

    #[test]
    fn test_short_head_decodes_empty() {
        let buf = [0x00, 0x02, b'{', b'}', b'x'];
        let p = Packet::decode(&buf).unwrap();
        assert!(p.head.is_empty());
        assert_eq!(&p.body[..], b"x");
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            kind in "[A-Z]{1,12}",
            extra in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..4),
            body in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let mut p = Packet::typed(&kind, body.clone());
            for (k, v) in extra {
                p.head.insert(k, Value::from(v));
            }
            let decoded = Packet::decode(&p.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded.kind(), Some(kind.as_str()));
            prop_assert_eq!(&decoded.body[..], &body[..]);
            for (k, v) in &p.head {
                prop_assert_eq!(decoded.head.get(k), Some(v));
            }
        }

        #[test]
        fn prop_truncation_never_panics(
            body in proptest::collection::vec(any::<u8>(), 1..256),
            cut in 0usize..64,
        ) {
            let buf = Packet::typed("MESSAGE", body).encode().unwrap();
            let end = buf.len().saturating_sub(cut + 1);
            prop_assert!(Packet::decode(&buf[..end]).is_err());
        }
    }
}
