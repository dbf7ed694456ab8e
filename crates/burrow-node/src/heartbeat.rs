//! Heartbeat streams. The server side beats a fixed sentinel on an interval;
//! the client side closes the stream when beats stop arriving.

use bytes::Bytes;
use burrow_protocol::{HEARTBEAT_PROTOCOL, HEARTBEAT_SENTINEL};
use libp2p::StreamProtocol;
use std::time::Duration;
use tokio::time::Instant;

use crate::connection::ConnectionManager;
use crate::events::{ClientEvent, ConnectionStatus};
use crate::link::bounded;
use crate::raw_stream::RawStream;

/// Write the sentinel every `interval` until the peer goes away.
pub async fn beat(mut stream: RawStream, interval: Duration) {
    let sentinel = Bytes::from_static(&HEARTBEAT_SENTINEL);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !stream.write(sentinel.clone()) {
                    break;
                }
            }
            unit = stream.read() => {
                if unit.is_none() {
                    break;
                }
            }
        }
    }
    stream.close();
    tracing::debug!("heartbeat: peer gone");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEnd {
    /// No sentinel within the timeout; the stream was closed locally.
    TimedOut,
    /// The peer closed the stream.
    Closed,
}

/// Watch a heartbeat stream. Only the sentinel resets the deadline.
pub async fn watch(mut stream: RawStream, timeout: Duration) -> HeartbeatEnd {
    let mut deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            unit = stream.read() => match unit {
                Some(unit) if unit[..] == HEARTBEAT_SENTINEL => {
                    tracing::trace!("heartbeat: beat");
                    deadline = Instant::now() + timeout;
                }
                Some(_) => tracing::debug!("heartbeat: ignoring unexpected unit"),
                None => return HeartbeatEnd::Closed,
            },
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(?timeout, "heartbeat: timed out");
                stream.close();
                return HeartbeatEnd::TimedOut;
            }
        }
    }
}

/// Client side: hold a heartbeat stream to the server while connected and
/// publish [`ClientEvent::HeartbeatLost`] whenever one times out.
pub async fn monitor(conn: ConnectionManager) {
    let shutdown = conn.shutdown_token();
    let mut status = conn.watch_status();
    let timing = *conn.timing();
    loop {
        let connected = tokio::select! {
            r = async { status.wait_for(|s| *s == ConnectionStatus::Connected).await.is_ok() } => r,
            _ = shutdown.cancelled() => false,
        };
        if !connected {
            return;
        }
        let Some(server) = conn.server_id().await else { return };
        let protocol = StreamProtocol::new(HEARTBEAT_PROTOCOL);
        match bounded(timing.dial_timeout(), conn.link().open_stream(server, protocol)).await {
            Ok(stream) => {
                let end = tokio::select! {
                    end = watch(stream, timing.heartbeat_timeout()) => end,
                    _ = shutdown.cancelled() => return,
                };
                if end == HeartbeatEnd::TimedOut {
                    conn.publish(ClientEvent::HeartbeatLost);
                }
            }
            Err(e) => tracing::debug!(%server, "heartbeat: cannot open stream: {e}"),
        }
        tokio::select! {
            _ = tokio::time::sleep(timing.heartbeat_interval()) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::HEARTBEAT_PROTOCOL;
    use libp2p::StreamProtocol;

    fn pair() -> (RawStream, RawStream) {
        RawStream::pair(StreamProtocol::new(HEARTBEAT_PROTOCOL))
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_keep_watch_alive() {
        let (client, server) = pair();
        let beats = tokio::spawn(beat(server, Duration::from_secs(5)));
        let watcher = tokio::spawn(watch(client, Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!watcher.is_finished());
        beats.abort();
        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (client, mut server) = pair();
        let watcher = tokio::spawn(watch(client, Duration::from_secs(10)));
        assert_eq!(watcher.await.unwrap(), HeartbeatEnd::TimedOut);
        assert!(server.read().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_sentinel_does_not_reset() {
        let (client, server) = pair();
        let started = Instant::now();
        let watcher = tokio::spawn(watch(client, Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(8)).await;
        server.write(Bytes::from_static(b"noise"));
        assert_eq!(watcher.await.unwrap(), HeartbeatEnd::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_lost_heartbeat() {
        use crate::test_support::{registry_with_server, FakeLink};
        use burrow_protocol::DEFAULT_TIMING;
        use std::sync::Arc;
        use tokio::sync::broadcast;
        use tokio_util::sync::CancellationToken;

        let link = Arc::new(FakeLink::new());
        let mut incoming = link.serve(StreamProtocol::new(HEARTBEAT_PROTOCOL));
        let (registry, _) = registry_with_server().await;
        let (events, mut rx) = broadcast::channel(64);
        let conn = ConnectionManager::new(link, registry, DEFAULT_TIMING, events, CancellationToken::new());
        conn.set_status(ConnectionStatus::Connected);
        let task = tokio::spawn(monitor(conn.clone()));

        // Server side stays silent
        let _silent = incoming.recv().await.unwrap();
        let started = Instant::now();
        loop {
            if let Ok(ClientEvent::HeartbeatLost) = rx.recv().await {
                break;
            }
        }
        assert!(started.elapsed() >= Duration::from_secs(10));
        conn.shutdown_token().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_beat_stops_when_peer_closes() {
        let (client, server) = pair();
        let beats = tokio::spawn(beat(server, Duration::from_millis(10)));
        client.close();
        beats.await.unwrap();
    }
}
