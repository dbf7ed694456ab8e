//! Stream factory and pool.
//!
//! The factory opens sub-streams to the server with an escalating timeout.
//! A failed open takes the reset gate: the winner backs off, restarts the
//! transport and re-seeds it, everyone else waits for the gate and retries.
//! The pool keeps idle streams per (protocol, kind) for reuse.

use libp2p::futures::future::BoxFuture;
use libp2p::StreamProtocol;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::backoff::RetryBackoff;
use crate::connection::ConnectionManager;
use crate::events::ConnectionStatus;
use crate::link::{bounded, TransportError};
use crate::raw_stream::RawStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Request,
    WebSocket,
}

/// Where tunnels get their streams from.
pub trait StreamSource: Send + Sync {
    fn checkout(
        &self,
        protocol: StreamProtocol,
        kind: StreamKind,
    ) -> BoxFuture<'_, Result<RawStream, TransportError>>;

    /// Hand a finished stream back. Closed streams are dropped.
    fn release(&self, kind: StreamKind, stream: RawStream);
}

pub struct StreamFactory {
    conn: ConnectionManager,
    dial_timeout: Mutex<Duration>,
    retry: Mutex<RetryBackoff>,
    reset_gate: tokio::sync::Mutex<()>,
}

impl StreamFactory {
    pub fn new(conn: ConnectionManager) -> Self {
        let timing = *conn.timing();
        Self {
            dial_timeout: Mutex::new(timing.dial_timeout()),
            retry: Mutex::new(RetryBackoff::new(
                Duration::from_millis(timing.retry_step_ms),
                Duration::from_millis(timing.retry_cap_ms),
            )),
            reset_gate: tokio::sync::Mutex::new(()),
            conn,
        }
    }

    pub fn current_dial_timeout(&self) -> Duration {
        self.dial_timeout
            .lock()
            .map(|t| *t)
            .unwrap_or(self.conn.timing().dial_timeout())
    }

    /// Open a stream to the server, retrying until it succeeds or the client
    /// shuts down.
    pub async fn get_stream(&self, protocol: StreamProtocol) -> Result<RawStream, TransportError> {
        let shutdown = self.conn.shutdown_token();
        loop {
            if shutdown.is_cancelled() {
                return Err(TransportError::ChannelClosed);
            }
            let server = self.conn.server_id().await.ok_or(TransportError::NoServer)?;
            let timeout = self.current_dial_timeout();
            let opened = bounded(timeout, self.conn.link().open_stream(server, protocol.clone())).await;
            match opened {
                Ok(stream) => {
                    self.reset_timeouts();
                    self.conn.mark_connected();
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::warn!(%protocol, ?timeout, "stream: open failed: {e}");
                    self.conn.demote("stream open failed");
                    match self.reset_gate.try_lock() {
                        Ok(_gate) => {
                            self.escalate();
                            let delay = self
                                .retry
                                .lock()
                                .map(|mut r| r.next_delay())
                                .unwrap_or(self.conn.timing().dial_timeout());
                            if delay.as_millis() as u64 >= self.conn.timing().offline_threshold_ms {
                                self.conn.set_status(ConnectionStatus::Offline);
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.cancelled() => return Err(TransportError::ChannelClosed),
                            }
                            tracing::info!(%protocol, "stream: resetting transport");
                            self.conn.reset_node().await;
                        }
                        Err(_) => {
                            // Someone else is resetting; retry once they finish
                            let _gate = self.reset_gate.lock().await;
                        }
                    }
                }
            }
        }
    }

    fn escalate(&self) {
        let max = self.conn.timing().max_dial_timeout();
        if let Ok(mut t) = self.dial_timeout.lock() {
            *t = (*t * 2).min(max);
        }
    }

    fn reset_timeouts(&self) {
        if let Ok(mut t) = self.dial_timeout.lock() {
            *t = self.conn.timing().dial_timeout();
        }
        if let Ok(mut r) = self.retry.lock() {
            r.reset();
        }
    }
}

/// Idle streams keyed by protocol and kind, in front of a factory.
pub struct StreamPool {
    factory: StreamFactory,
    idle: Mutex<HashMap<(StreamProtocol, StreamKind), Vec<RawStream>>>,
}

impl StreamPool {
    pub fn new(factory: StreamFactory) -> Self {
        Self {
            factory,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &StreamFactory {
        &self.factory
    }

    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn take_idle(&self, protocol: &StreamProtocol, kind: StreamKind) -> Option<RawStream> {
        let mut idle = self.idle.lock().ok()?;
        let streams = idle.get_mut(&(protocol.clone(), kind))?;
        while let Some(stream) = streams.pop() {
            if stream.is_open() {
                return Some(stream);
            }
        }
        None
    }
}

impl StreamSource for StreamPool {
    fn checkout(
        &self,
        protocol: StreamProtocol,
        kind: StreamKind,
    ) -> BoxFuture<'_, Result<RawStream, TransportError>> {
        Box::pin(async move {
            if let Some(stream) = self.take_idle(&protocol, kind) {
                tracing::trace!(%protocol, ?kind, "stream: reusing pooled stream");
                return Ok(stream);
            }
            self.factory.get_stream(protocol).await
        })
    }

    fn release(&self, kind: StreamKind, stream: RawStream) {
        if !stream.is_open() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.entry((stream.protocol().clone(), kind)).or_default().push(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ClientEvent;
    use crate::test_support::{registry_with_server, FakeLink};
    use burrow_protocol::DEFAULT_TIMING;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    const PROTO: StreamProtocol = StreamProtocol::new("/burrow/request/1.0.0");

    async fn pool(link: Arc<FakeLink>) -> (Arc<StreamPool>, ConnectionManager) {
        let (registry, _) = registry_with_server().await;
        let (events, _) = broadcast::channel::<ClientEvent>(64);
        let conn = ConnectionManager::new(link, registry, DEFAULT_TIMING, events, CancellationToken::new());
        conn.mark_bootstrapped();
        (Arc::new(StreamPool::new(StreamFactory::new(conn.clone()))), conn)
    }

    #[tokio::test]
    async fn test_open_marks_connected() {
        let link = Arc::new(FakeLink::new());
        let _server = link.serve(PROTO);
        let (pool, conn) = pool(link.clone()).await;
        let stream = pool.checkout(PROTO, StreamKind::Request).await.unwrap();
        assert!(stream.is_open());
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_released_stream_is_reused() {
        let link = Arc::new(FakeLink::new());
        let _server = link.serve(PROTO);
        let (pool, _) = pool(link.clone()).await;

        let stream = pool.checkout(PROTO, StreamKind::Request).await.unwrap();
        pool.release(StreamKind::Request, stream);
        assert_eq!(pool.idle_count(), 1);

        let _again = pool.checkout(PROTO, StreamKind::Request).await.unwrap();
        assert_eq!(link.opens.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_stream_not_pooled() {
        let link = Arc::new(FakeLink::new());
        let _server = link.serve(PROTO);
        let (pool, _) = pool(link.clone()).await;

        let stream = pool.checkout(PROTO, StreamKind::Request).await.unwrap();
        stream.close();
        pool.release(StreamKind::Request, stream);
        assert_eq!(pool.idle_count(), 0);

        // Kind is part of the key
        let ws = pool.checkout(PROTO, StreamKind::WebSocket).await.unwrap();
        pool.release(StreamKind::WebSocket, ws);
        let _req = pool.checkout(PROTO, StreamKind::Request).await.unwrap();
        assert_eq!(link.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_reset_once() {
        let link = Arc::new(FakeLink::new());
        let _server = link.serve(PROTO);
        link.open_ok.store(false, Ordering::SeqCst);
        let (pool, conn) = pool(link.clone()).await;

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.factory().get_stream(PROTO).await })
            })
            .collect();

        // All opens time out at 3s; the gate winner backs off for 1s
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(pool.factory().current_dial_timeout(), Duration::from_secs(6));
        link.open_ok.store(true, Ordering::SeqCst);

        for caller in callers {
            assert!(caller.await.unwrap().is_ok());
        }
        assert_eq!(link.resets.load(Ordering::SeqCst), 1);
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert_eq!(pool.factory().current_dial_timeout(), DEFAULT_TIMING.dial_timeout());
    }
}
