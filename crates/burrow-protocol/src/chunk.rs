//! Typed-chunk framing for tunneled requests and responses.
//!
//! Every unit starts with a 1-byte tag. A message is zero or more HEAD chunks
//! (concatenated: `[u16 BE length][JSON]`, the length counting the prefix
//! itself), zero or more BODY chunks in arrival order, then one END. ABORT may
//! replace the tail at any point and tells the other side to release resources.

use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::packet::HEAD_PREFIX_SIZE;
use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    Head = 0x00,
    Body = 0x01,
    End = 0x02,
    Abort = 0x03,
}

impl TryFrom<u8> for ChunkType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x00 => Ok(Self::Head),
            0x01 => Ok(Self::Body),
            0x02 => Ok(Self::End),
            0x03 => Ok(Self::Abort),
            other => Err(ProtocolError::UnknownChunkType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Head(Bytes),
    Body(Bytes),
    End,
    Abort,
}

impl Chunk {
    pub fn kind(&self) -> ChunkType {
        match self {
            Chunk::Head(_) => ChunkType::Head,
            Chunk::Body(_) => ChunkType::Body,
            Chunk::End => ChunkType::End,
            Chunk::Abort => ChunkType::Abort,
        }
    }

    pub fn parse(mut unit: Bytes) -> Result<Self, ProtocolError> {
        if unit.is_empty() {
            return Err(ProtocolError::EmptyChunk);
        }
        let tag = ChunkType::try_from(unit[0])?;
        let payload = unit.split_off(1);
        Ok(match tag {
            ChunkType::Head => Chunk::Head(payload),
            ChunkType::Body => Chunk::Body(payload),
            ChunkType::End => Chunk::End,
            ChunkType::Abort => Chunk::Abort,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let payload: &[u8] = match self {
            Chunk::Head(p) | Chunk::Body(p) => p,
            Chunk::End | Chunk::Abort => &[],
        };
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(self.kind() as u8);
        buf.extend_from_slice(payload);
        buf.freeze()
    }
}

/// Serialize a head as `[u16 BE total length][JSON]`.
pub fn encode_head<T: Serialize>(head: &T) -> Result<Bytes, ProtocolError> {
    let json = serde_json::to_vec(head)?;
    let total = HEAD_PREFIX_SIZE + json.len();
    if total > u16::MAX as usize {
        return Err(ProtocolError::HeadTooLarge {
            size: total,
            max: u16::MAX as usize,
        });
    }
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16(total as u16);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Cut an encoded head into HEAD chunks.
pub fn head_chunks(encoded: Bytes, chunk_size: usize) -> Vec<Chunk> {
    crate::codec::slices(encoded, chunk_size)
        .into_iter()
        .map(Chunk::Head)
        .collect()
}

/// Cut a body into BODY chunks. An empty body produces no chunks.
pub fn body_chunks(body: Bytes, chunk_size: usize) -> Vec<Chunk> {
    crate::codec::slices(body, chunk_size)
        .into_iter()
        .map(Chunk::Body)
        .collect()
}

/// Frame a complete message: HEAD chunks, BODY chunks, END.
pub fn frame_message<T: Serialize>(
    head: &T,
    body: Bytes,
    chunk_size: usize,
) -> Result<Vec<Chunk>, ProtocolError> {
    let mut chunks = head_chunks(encode_head(head)?, chunk_size);
    chunks.extend(body_chunks(body, chunk_size));
    chunks.push(Chunk::End);
    Ok(chunks)
}

/// A decoded step of an incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    Head(T),
    Body(Bytes),
    End,
    Abort,
}

/// Incremental reader for typed-chunk messages. Resets after END or ABORT so
/// the same reader serves sequential messages on one stream.
#[derive(Debug)]
pub struct FrameReader<T> {
    head: BytesMut,
    head_done: bool,
    _head: PhantomData<fn() -> T>,
}

impl<T> Default for FrameReader<T> {
    fn default() -> Self {
        Self {
            head: BytesMut::new(),
            head_done: false,
            _head: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> FrameReader<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head_received(&self) -> bool {
        self.head_done
    }

    /// Feed one chunk. Returns `Ok(None)` while a head is still incomplete.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<Frame<T>>, ProtocolError> {
        match chunk {
            Chunk::Head(payload) => {
                if self.head_done {
                    return Err(ProtocolError::UnexpectedChunk("head after head"));
                }
                self.head.extend_from_slice(&payload);
                self.try_head()
            }
            Chunk::Body(payload) => {
                if !self.head_done {
                    return Err(ProtocolError::UnexpectedChunk("body before head"));
                }
                Ok(Some(Frame::Body(payload)))
            }
            Chunk::End => {
                self.reset();
                Ok(Some(Frame::End))
            }
            Chunk::Abort => {
                self.reset();
                Ok(Some(Frame::Abort))
            }
        }
    }

    fn try_head(&mut self) -> Result<Option<Frame<T>>, ProtocolError> {
        if self.head.len() < HEAD_PREFIX_SIZE {
            return Ok(None);
        }
        let total = u16::from_be_bytes([self.head[0], self.head[1]]) as usize;
        if total < HEAD_PREFIX_SIZE {
            return Err(ProtocolError::InvalidHead(format!("head length {total}")));
        }
        if self.head.len() < total {
            return Ok(None);
        }
        let head = serde_json::from_slice(&self.head[HEAD_PREFIX_SIZE..total])?;
        self.head.clear();
        self.head_done = true;
        Ok(Some(Frame::Head(head)))
    }

    fn reset(&mut self) {
        self.head.clear();
        self.head_done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{RequestHead, ResponseHead};

    fn request() -> RequestHead {
        RequestHead {
            method: "POST".into(),
            url: "http://box.local/api".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
        }
    }

    #[test]
    fn test_chunk_tags() {
        assert_eq!(Chunk::End.to_bytes()[..], [0x02]);
        assert_eq!(Chunk::Abort.to_bytes()[..], [0x03]);
        let body = Chunk::Body(Bytes::from_static(b"xy")).to_bytes();
        assert_eq!(&body[..], &[0x01, b'x', b'y']);
    }

    #[test]
    fn test_parse_rejects_unknown_and_empty() {
        assert!(matches!(
            Chunk::parse(Bytes::from_static(&[0x09])),
            Err(ProtocolError::UnknownChunkType(0x09))
        ));
        assert!(matches!(Chunk::parse(Bytes::new()), Err(ProtocolError::EmptyChunk)));
    }

    #[test]
    fn test_head_length_counts_prefix() {
        let encoded = encode_head(&request()).unwrap();
        let declared = u16::from_be_bytes([encoded[0], encoded[1]]) as usize;
        assert_eq!(declared, encoded.len());
    }

    #[test]
    fn test_message_roundtrip_through_units() {
        let body = Bytes::from(vec![5u8; 150_000]);
        let chunks = frame_message(&request(), body.clone(), crate::CHUNK_SIZE).unwrap();
        assert_eq!(chunks.last(), Some(&Chunk::End));

        let mut reader = FrameReader::<RequestHead>::new();
        let mut got_head = None;
        let mut got_body = BytesMut::new();
        let mut ended = false;
        for chunk in chunks {
            let unit = chunk.to_bytes();
            match reader.push(Chunk::parse(unit).unwrap()).unwrap() {
                Some(Frame::Head(h)) => got_head = Some(h),
                Some(Frame::Body(b)) => got_body.extend_from_slice(&b),
                Some(Frame::End) => ended = true,
                Some(Frame::Abort) => panic!("unexpected abort"),
                None => {}
            }
        }
        assert_eq!(got_head, Some(request()));
        assert_eq!(got_body.freeze(), body);
        assert!(ended);
    }

    #[test]
    fn test_head_split_across_one_byte_chunks() {
        let encoded = encode_head(&request()).unwrap();
        let mut reader = FrameReader::<RequestHead>::new();
        let parts = head_chunks(encoded, 1);
        let n = parts.len();
        for (i, chunk) in parts.into_iter().enumerate() {
            let out = reader.push(chunk).unwrap();
            if i + 1 < n {
                assert!(out.is_none());
            } else {
                assert_eq!(out, Some(Frame::Head(request())));
            }
        }
    }

    #[test]
    fn test_body_before_head_is_rejected() {
        let mut reader = FrameReader::<ResponseHead>::new();
        assert!(reader.push(Chunk::Body(Bytes::from_static(b"x"))).is_err());
    }

    #[test]
    fn test_reader_resets_after_end_and_abort() {
        let mut reader = FrameReader::<RequestHead>::new();
        for chunk in head_chunks(encode_head(&request()).unwrap(), 16) {
            reader.push(chunk).unwrap();
        }
        assert!(reader.head_received());
        assert_eq!(reader.push(Chunk::Abort).unwrap(), Some(Frame::Abort));
        assert!(!reader.head_received());

        // Next message on the same reader
        for chunk in head_chunks(encode_head(&request()).unwrap(), 16) {
            reader.push(chunk).unwrap();
        }
        assert!(reader.head_received());
        assert_eq!(reader.push(Chunk::End).unwrap(), Some(Frame::End));
    }

    #[test]
    fn test_empty_body_has_no_body_chunks() {
        let chunks = frame_message(&request(), Bytes::new(), crate::CHUNK_SIZE).unwrap();
        assert!(chunks.iter().all(|c| c.kind() != ChunkType::Body));
    }
}
