//! Client side of relay announcements: once connected, read the home peer's
//! announced addresses and feed them into the registry and the dialer.

use burrow_bootstrap::AddOutcome;
use burrow_protocol::RELAY_PROTOCOL;
use libp2p::StreamProtocol;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::connection::ConnectionManager;
use crate::events::{ClientEvent, ConnectionStatus};
use crate::link::bounded;

pub struct RelayFeed {
    conn: ConnectionManager,
    debounce: Duration,
    last_open: Mutex<Option<Instant>>,
}

impl RelayFeed {
    pub fn new(conn: ConnectionManager) -> Self {
        let debounce = Duration::from_millis(conn.timing().relay_debounce_ms);
        Self {
            conn,
            debounce,
            last_open: Mutex::new(None),
        }
    }

    /// Open the relay stream on every transition to CONNECTED, at most once
    /// per debounce window.
    pub async fn run(self: Arc<Self>) {
        let shutdown = self.conn.shutdown_token();
        let mut status = self.conn.watch_status();
        loop {
            let connected = tokio::select! {
                r = async { status.wait_for(|s| *s == ConnectionStatus::Connected).await.is_ok() } => r,
                _ = shutdown.cancelled() => false,
            };
            if !connected {
                return;
            }
            if self.try_begin() {
                tokio::spawn(self.clone().consume());
            }
            let left = tokio::select! {
                r = async { status.wait_for(|s| *s != ConnectionStatus::Connected).await.is_ok() } => r,
                _ = shutdown.cancelled() => false,
            };
            if !left {
                return;
            }
        }
    }

    fn try_begin(&self) -> bool {
        let Ok(mut last) = self.last_open.lock() else {
            return false;
        };
        let now = Instant::now();
        if last.is_some_and(|t| now.duration_since(t) < self.debounce) {
            tracing::debug!("relay: stream opened recently, skipping");
            return false;
        }
        *last = Some(now);
        true
    }

    /// Read announced addresses until the stream closes.
    pub async fn consume(self: Arc<Self>) {
        let Some(server) = self.conn.server_id().await else {
            return;
        };
        let link = self.conn.link().clone();
        let registry = self.conn.registry().clone();
        let protocol = StreamProtocol::new(RELAY_PROTOCOL);
        let mut stream = match bounded(self.conn.timing().dial_timeout(), link.open_stream(server, protocol)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(%server, "relay: cannot open relay stream: {e}");
                return;
            }
        };
        let shutdown = self.conn.shutdown_token();
        let mut loaded = 0usize;
        loop {
            let unit = tokio::select! {
                u = stream.read() => u,
                _ = shutdown.cancelled() => None,
            };
            let Some(unit) = unit else { break };
            let Ok(addr) = std::str::from_utf8(&unit) else {
                tracing::warn!("relay: announcement is not utf-8");
                continue;
            };
            match registry.add_announced(addr).await {
                Ok(AddOutcome::Added { .. }) => {
                    loaded += 1;
                    link.add_addresses(server, registry.all_multiaddrs().await).await;
                    tracing::info!(%addr, "relay: address loaded");
                    self.conn.publish(ClientEvent::RelaysLoaded { count: loaded });
                }
                Ok(outcome) => tracing::debug!(%addr, ?outcome, "relay: address not added"),
                Err(e) => tracing::warn!(%addr, "relay: bad announcement: {e}"),
            }
        }
        stream.close();
        tracing::debug!(loaded, "relay: stream ended");
    }
}
