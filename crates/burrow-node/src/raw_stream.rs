//! Raw stream -- buffered unit read/write over one multiplexed sub-stream.
//!
//! The underlying pipe carries units delimited by a 4-byte big-endian length.
//! Writes are queued and flushed by a writer task in order; reads pull one
//! unit at a time. Any error on the inbound side closes the stream quietly:
//! `read()` then returns `None` instead of surfacing the error.

use bytes::Bytes;
use libp2p::futures::{SinkExt, StreamExt};
use libp2p::StreamProtocol;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;

enum WriteOp {
    Unit(Bytes),
    Close,
}

struct StreamState {
    protocol: StreamProtocol,
    open: AtomicBool,
    closed: CancellationToken,
    /// Cancelled once the writer task has drained and closed the pipe.
    flushed: CancellationToken,
}

impl StreamState {
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// One sub-stream, owned by whoever opened or accepted it.
pub struct RawStream {
    reader: StreamReader,
    writer: StreamWriter,
}

/// Inbound half. Not cloneable: one reader per stream.
pub struct StreamReader {
    inner: FramedRead<BoxRead, LengthDelimitedCodec>,
    state: Arc<StreamState>,
}

/// Outbound half. Cheap to clone; writes from all clones are queued in order.
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
    state: Arc<StreamState>,
}

impl RawStream {
    pub fn new<T>(io: T, protocol: StreamProtocol) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(io);
        let state = Arc::new(StreamState {
            protocol,
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            flushed: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(
            FramedWrite::new(wr, LengthDelimitedCodec::new()),
            rx,
            state.clone(),
        ));
        let rd: BoxRead = Box::new(rd);
        Self {
            reader: StreamReader {
                inner: FramedRead::new(rd, LengthDelimitedCodec::new()),
                state: state.clone(),
            },
            writer: StreamWriter { tx, state },
        }
    }

    pub fn from_libp2p(stream: libp2p::Stream, protocol: StreamProtocol) -> Self {
        Self::new(stream.compat(), protocol)
    }

    /// In-memory connected pair.
    pub fn pair(protocol: StreamProtocol) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (Self::new(a, protocol.clone()), Self::new(b, protocol))
    }

    pub async fn read(&mut self) -> Option<Bytes> {
        self.reader.read().await
    }

    pub fn write(&self, unit: Bytes) -> bool {
        self.writer.write(unit)
    }

    pub fn close(&self) {
        self.writer.close()
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_open()
    }

    /// Resolves once every queued unit has been written out after `close()`.
    pub fn flushed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let flushed = self.writer.state.flushed.clone();
        async move { flushed.cancelled().await }
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.writer.state.protocol
    }

    pub fn writer(&self) -> StreamWriter {
        self.writer.clone()
    }

    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }

    pub fn unsplit(reader: StreamReader, writer: StreamWriter) -> Self {
        Self { reader, writer }
    }
}

impl StreamReader {
    /// Next unit, or `None` once the stream is closed either way.
    pub async fn read(&mut self) -> Option<Bytes> {
        if self.state.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.state.closed.cancelled() => None,
            next = self.inner.next() => match next {
                Some(Ok(unit)) => Some(unit.freeze()),
                Some(Err(e)) => {
                    tracing::debug!(protocol = %self.state.protocol, "stream: read failed: {e}");
                    self.state.close();
                    None
                }
                None => {
                    self.state.close();
                    None
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
}

impl StreamWriter {
    /// Queue one unit. Returns false if the stream is already closed.
    pub fn write(&self, unit: Bytes) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(WriteOp::Unit(unit)).is_ok()
    }

    /// Flush queued units, then close the underlying pipe. Wakes a blocked
    /// reader immediately.
    pub fn close(&self) {
        if self.state.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(WriteOp::Close);
        }
        self.state.closed.cancel();
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Resolves once the stream is closed from either side.
    pub async fn closed(&self) {
        self.state.closed.cancelled().await
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    state: Arc<StreamState>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Unit(unit) => {
                if let Err(e) = sink.send(unit).await {
                    tracing::debug!(protocol = %state.protocol, "stream: write failed: {e}");
                    state.close();
                    state.flushed.cancel();
                    return;
                }
            }
            WriteOp::Close => break,
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
    state.close();
    state.flushed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTO: StreamProtocol = StreamProtocol::new("/test/1.0.0");

    #[tokio::test]
    async fn test_units_arrive_in_order() {
        let (a, mut b) = RawStream::pair(PROTO);
        for i in 0..10u8 {
            assert!(a.write(Bytes::from(vec![i; i as usize + 1])));
        }
        for i in 0..10u8 {
            assert_eq!(b.read().await.unwrap(), Bytes::from(vec![i; i as usize + 1]));
        }
    }

    #[tokio::test]
    async fn test_close_flushes_then_ends_peer() {
        let (a, mut b) = RawStream::pair(PROTO);
        a.write(Bytes::from_static(b"last"));
        a.close();
        assert!(!a.is_open());
        assert!(!a.write(Bytes::from_static(b"dropped")));

        assert_eq!(b.read().await.unwrap(), Bytes::from_static(b"last"));
        assert!(b.read().await.is_none());
        assert!(!b.is_open());
    }

    #[tokio::test]
    async fn test_local_close_wakes_blocked_reader() {
        let (a, _b) = RawStream::pair(PROTO);
        let (mut reader, writer) = a.split();
        let pending = tokio::spawn(async move { reader.read().await });
        tokio::task::yield_now().await;
        writer.close();
        assert!(pending.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_input_closes_quietly() {
        use tokio::io::AsyncWriteExt;
        let (raw, io) = tokio::io::duplex(1024);
        let mut stream = RawStream::new(io, PROTO);
        let mut raw = raw;
        // Length prefix larger than the codec allows
        raw.write_all(&[0xff, 0xff, 0xff, 0xff, 0x00]).await.unwrap();
        assert!(stream.read().await.is_none());
        assert!(!stream.is_open());
    }

    #[tokio::test]
    async fn test_flushed_resolves_once_drained() {
        let (a, mut b) = RawStream::pair(PROTO);
        assert!(a.write(Bytes::from_static(b"last words")));
        a.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), a.flushed()).await.unwrap();
        assert_eq!(b.read().await.unwrap(), Bytes::from_static(b"last words"));
        assert!(b.read().await.is_none());
    }
}
