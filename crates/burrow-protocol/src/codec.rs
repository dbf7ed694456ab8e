//! Packet reassembly for chunked transports.
//!
//! Large packets are cut into fixed-size slices that do not line up with packet
//! boundaries. [`PacketCodec`] accumulates slices until the head length is
//! known, then until the declared body length is satisfied, and yields the
//! packet exactly once.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{declared_body_length, parse_head, peek_head_len, Packet, HEAD_PREFIX_SIZE};
use crate::ProtocolError;

/// Maximum reassembled packet size: 64 MB.
const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// Codec for framing [`Packet`] values over a byte sequence.
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Total size of the packet being reassembled, once its head is known.
    pending: Option<usize>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame_len(&self, src: &BytesMut) -> Result<Option<usize>, ProtocolError> {
        if let Some(total) = self.pending {
            return Ok(Some(total));
        }
        if src.len() < HEAD_PREFIX_SIZE {
            return Ok(None);
        }
        let head_len = peek_head_len(src)?;
        let head_end = HEAD_PREFIX_SIZE + head_len;
        if src.len() < head_end {
            return Ok(None);
        }

        let head = parse_head(&src[HEAD_PREFIX_SIZE..head_end])?;
        let total = head_end + declared_body_length(&head).unwrap_or(0);
        if total > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: total,
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(Some(total))
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(total) = self.frame_len(src)? else {
            return Ok(None);
        };

        if src.len() < total {
            self.pending = Some(total);
            src.reserve(total - src.len());
            return Ok(None);
        }

        self.pending = None;
        let frame = src.split_to(total);
        Packet::decode(&frame).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = item.encode()?;
        if encoded.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: encoded.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

/// Split an encoded buffer into slices of at most `size` bytes.
pub fn slices(encoded: Bytes, size: usize) -> Vec<Bytes> {
    let size = size.max(1);
    let mut out = Vec::with_capacity(encoded.len().div_ceil(size));
    let mut rest = encoded;
    while !rest.is_empty() {
        let n = rest.len().min(size);
        out.push(rest.split_to(n));
    }
    out
}
