//! Request tunnel -- sends one HTTP request over a request stream and waits
//! for the framed response.
//!
//! Every try runs as a [`RequestAttempt`] that fails on its own when the
//! response stalls, instead of waiting for the transport to notice. Failed
//! attempts close their stream and start over with a larger budget; there is
//! no attempt cap. Only an explicit answer from the server ends the loop.

use bytes::{Bytes, BytesMut};
use burrow_protocol::chunk::frame_message;
use burrow_protocol::{
    Chunk, ChunkType, Frame, FrameReader, ProtocolError, RequestHead, ResponseHead, TunnelTiming,
    REQUEST_PROTOCOL,
};
use libp2p::StreamProtocol;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::ConnectionStatus;
use crate::link::TransportError;
use crate::raw_stream::RawStream;
use crate::stream_factory::{StreamKind, StreamSource};

#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub head: RequestHead,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("no chunk for {gap:?} (threshold {threshold:?})")]
    Stall { gap: Duration, threshold: Duration },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection left CONNECTED")]
    Disconnected,
    #[error("stream: {0}")]
    Stream(String),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server aborted the response")]
    Aborted,
    #[error("request cancelled")]
    Cancelled,
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

impl TunnelError {
    /// Transport hiccups and stalls are retried; explicit outcomes are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::Stall { .. }
                | TunnelError::Timeout(_)
                | TunnelError::Disconnected
                | TunnelError::Stream(_)
                | TunnelError::Protocol(_)
        )
    }
}

/// Timing supervision of one try.
#[derive(Debug, Clone)]
pub struct RequestAttempt {
    budget: Duration,
    started: Instant,
    last_chunk: Option<Instant>,
    first_chunk: Option<Duration>,
    longest_gap: Duration,
    gap_floor: Duration,
    gap_multiplier: u32,
}

impl RequestAttempt {
    pub fn new(budget: Duration, timing: &TunnelTiming, started: Instant) -> Self {
        Self {
            budget,
            started,
            last_chunk: None,
            first_chunk: None,
            longest_gap: Duration::ZERO,
            gap_floor: Duration::from_millis(timing.chunk_gap_floor_ms),
            gap_multiplier: timing.chunk_gap_multiplier,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Latency from the start of the attempt to the first chunk.
    pub fn first_chunk(&self) -> Option<Duration> {
        self.first_chunk
    }

    pub fn longest_gap(&self) -> Duration {
        self.longest_gap
    }

    pub fn record_chunk(&mut self, now: Instant) {
        let since = self.last_chunk.unwrap_or(self.started);
        let gap = now.saturating_duration_since(since);
        if self.first_chunk.is_none() {
            self.first_chunk = Some(gap);
        }
        self.longest_gap = self.longest_gap.max(gap);
        self.last_chunk = Some(now);
    }

    /// Gap after which the attempt counts as stalled.
    pub fn stall_threshold(&self) -> Duration {
        (self.longest_gap * self.gap_multiplier).max(self.gap_floor)
    }

    pub fn check(&self, now: Instant) -> Result<(), TunnelError> {
        match self.last_chunk {
            None => {
                let waited = now.saturating_duration_since(self.started);
                if waited > self.budget {
                    return Err(TunnelError::Timeout(self.budget));
                }
            }
            Some(last) => {
                let gap = now.saturating_duration_since(last);
                let threshold = self.stall_threshold();
                if gap > threshold {
                    return Err(TunnelError::Stall { gap, threshold });
                }
            }
        }
        Ok(())
    }
}

pub struct RequestTunnel {
    source: Arc<dyn StreamSource>,
    status: watch::Receiver<ConnectionStatus>,
    timing: TunnelTiming,
    protocol: StreamProtocol,
}

impl RequestTunnel {
    pub fn new(
        source: Arc<dyn StreamSource>,
        status: watch::Receiver<ConnectionStatus>,
        timing: TunnelTiming,
    ) -> Self {
        Self {
            source,
            status,
            timing,
            protocol: StreamProtocol::new(REQUEST_PROTOCOL),
        }
    }

    /// Budget for the attempt after one that failed.
    pub fn next_budget(&self, budget: Duration, body_chunks: usize) -> Duration {
        budget + Duration::from_millis(self.timing.per_chunk_budget_ms) * body_chunks.max(1) as u32
    }

    pub async fn send(
        &self,
        request: TunnelRequest,
        cancel: CancellationToken,
    ) -> Result<TunnelResponse, TunnelError> {
        let body = if request.head.allows_body() {
            request.body
        } else {
            Bytes::new()
        };
        let chunks = frame_message(&request.head, body, self.timing.chunk_size)?;
        let body_chunks = chunks.iter().filter(|c| c.kind() == ChunkType::Body).count();

        let mut budget = Duration::from_millis(self.timing.attempt_timeout_ms);
        let mut attempt = 1u32;
        loop {
            match self.attempt(&chunks, budget, &cancel).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    budget = self.next_budget(budget, body_chunks);
                    tracing::warn!(
                        url = %request.head.url,
                        attempt,
                        next_budget = ?budget,
                        "tunnel: attempt failed, retrying: {e}"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        chunks: &[Chunk],
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<TunnelResponse, TunnelError> {
        let mut stream = tokio::select! {
            s = self.source.checkout(self.protocol.clone(), StreamKind::Request) => s?,
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
        };

        match self.exchange(&mut stream, chunks, budget, cancel).await {
            Ok(response) => {
                self.source.release(StreamKind::Request, stream);
                Ok(response)
            }
            Err(e) => {
                let aborting = matches!(e, TunnelError::Cancelled) && stream.write(Chunk::Abort.to_bytes());
                stream.close();
                if aborting && tokio::time::timeout(self.timing.abort_grace(), stream.flushed()).await.is_err() {
                    tracing::debug!("tunnel: abort not flushed within {:?}", self.timing.abort_grace());
                }
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        stream: &mut RawStream,
        chunks: &[Chunk],
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<TunnelResponse, TunnelError> {
        for chunk in chunks {
            if !stream.write(chunk.to_bytes()) {
                return Err(TunnelError::Stream("closed while writing request".into()));
            }
        }

        let mut status = self.status.clone();
        status.borrow_and_update();
        let mut tracker = RequestAttempt::new(budget, &self.timing, Instant::now());
        let mut tick = tokio::time::interval(Duration::from_millis(self.timing.attempt_tick_ms));
        let mut reader = FrameReader::<ResponseHead>::new();
        let mut head = None;
        let mut body = BytesMut::new();

        loop {
            tokio::select! {
                unit = stream.read() => {
                    let Some(unit) = unit else {
                        return Err(TunnelError::Stream("closed by peer".into()));
                    };
                    tracker.record_chunk(Instant::now());
                    match reader.push(Chunk::parse(unit)?)? {
                        None => {}
                        Some(Frame::Head(h)) => head = Some(h),
                        Some(Frame::Body(b)) => body.extend_from_slice(&b),
                        Some(Frame::End) => {
                            let head = head.ok_or(ProtocolError::UnexpectedChunk("end before head"))?;
                            tracing::debug!(
                                status = head.status,
                                first_chunk = ?tracker.first_chunk(),
                                longest_gap = ?tracker.longest_gap(),
                                "tunnel: response complete"
                            );
                            return Ok(TunnelResponse { head, body: body.freeze() });
                        }
                        Some(Frame::Abort) if head.is_some() => return Err(TunnelError::Aborted),
                        Some(Frame::Abort) => {
                            return Err(TunnelError::Stream("aborted before head".into()));
                        }
                    }
                }
                _ = tick.tick() => tracker.check(Instant::now())?,
                changed = status.changed() => {
                    if changed.is_err() || *status.borrow_and_update() != ConnectionStatus::Connected {
                        return Err(TunnelError::Disconnected);
                    }
                }
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            }
        }
    }
}
