//! Connection manager -- owns the status state machine and keeps the client
//! connected to its server peer.
//!
//! Three activities run side by side:
//! - discovery-driven dial: the first sighting of the server peer triggers a dial;
//! - the dial routine: dial, back off, re-seed the address book, repeat;
//! - the liveness loop: ping while connected, demote after repeated failures.
//!
//! Once connected, the registry is also re-probed periodically.
//!
//! A watchdog demotes CONNECTING to OFFLINE if no connection is made in time.

use burrow_bootstrap::Registry;
use burrow_protocol::TunnelTiming;
use libp2p::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryBackoff;
use crate::events::{ClientEvent, ConnectionStatus};
use crate::link::{bounded, PeerLink};
use crate::swarm_task::NetEvent;

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    link: Arc<dyn PeerLink>,
    registry: Arc<Registry>,
    timing: TunnelTiming,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
    backoff: Mutex<RetryBackoff>,
    /// Held by the one running dial routine.
    dialing: tokio::sync::Mutex<()>,
    watchdog_armed: AtomicBool,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        link: Arc<dyn PeerLink>,
        registry: Arc<Registry>,
        timing: TunnelTiming,
        events: broadcast::Sender<ClientEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Offline);
        Self {
            inner: Arc::new(Inner {
                link,
                registry,
                backoff: Mutex::new(RetryBackoff::new(
                    Duration::from_millis(timing.retry_step_ms),
                    Duration::from_millis(timing.retry_cap_ms),
                )),
                timing,
                status,
                events,
                dialing: tokio::sync::Mutex::new(()),
                watchdog_armed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn publish(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.inner.link
    }

    pub fn timing(&self) -> &TunnelTiming {
        &self.inner.timing
    }

    /// Transition to `next`. Returns false if the status was already `next`.
    pub fn set_status(&self, next: ConnectionStatus) -> bool {
        let mut previous = next;
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if !changed {
            return false;
        }
        tracing::info!(from = %previous, to = %next, "conn: status changed");
        self.publish(ClientEvent::Status(next));
        if previous == ConnectionStatus::Connected {
            self.publish(ClientEvent::Disconnected);
        }
        if next == ConnectionStatus::Connecting {
            self.arm_watchdog();
        }
        true
    }

    /// OFFLINE -> BOOTSTRAPPED once the registry holds usable addresses.
    pub fn mark_bootstrapped(&self) {
        if self.status() == ConnectionStatus::Offline {
            self.set_status(ConnectionStatus::Bootstrapped);
        }
    }

    /// A stream opened successfully, so the connection is live.
    pub fn mark_connected(&self) {
        if self.set_status(ConnectionStatus::Connected) {
            self.inner.backoff.lock().map(|mut b| b.reset()).ok();
        }
    }

    /// Leave CONNECTED after a detected failure.
    pub fn demote(&self, reason: &str) {
        if self.status() == ConnectionStatus::Connected {
            tracing::warn!(reason, "conn: connection lost");
            self.set_status(ConnectionStatus::Connecting);
        }
    }

    /// Start the dial routine in the background unless one is running.
    pub fn spawn_connect(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.connect_to_server().await;
        });
    }

    // ========================================================================
    // Dial routine
    // ========================================================================

    /// Dial the server peer until connected or shut down. Returns false if
    /// another routine was already running or the manager shut down first.
    pub async fn connect_to_server(&self) -> bool {
        let Ok(_guard) = self.inner.dialing.try_lock() else {
            tracing::debug!("conn: dial routine already running");
            return false;
        };
        let inner = &self.inner;
        loop {
            if inner.shutdown.is_cancelled() {
                return false;
            }
            let Some(server) = inner.registry.server_id().await else {
                tracing::error!("conn: no server peer id, cannot dial");
                self.set_status(ConnectionStatus::Offline);
                return false;
            };
            if self.status() == ConnectionStatus::Connected {
                return true;
            }
            if self.status() == ConnectionStatus::Bootstrapped {
                self.set_status(ConnectionStatus::Connecting);
            }

            // The transport may have forgotten addresses since the last attempt
            inner
                .link
                .add_addresses(server, inner.registry.all_multiaddrs().await)
                .await;
            let ranked = inner.registry.ranked_multiaddrs().await;

            match bounded(inner.timing.dial_timeout(), inner.link.dial(server, ranked)).await {
                Ok(()) => {
                    if let Ok(mut b) = inner.backoff.lock() {
                        b.reset();
                    }
                    tracing::info!(%server, "conn: connected to server");
                    self.set_status(ConnectionStatus::Connected);
                    self.publish(ClientEvent::Connected(server));
                    return true;
                }
                Err(e) => {
                    let delay = inner
                        .backoff
                        .lock()
                        .map(|mut b| b.next_delay())
                        .unwrap_or(Duration::from_millis(inner.timing.retry_step_ms));
                    tracing::debug!(%server, ?delay, "conn: dial failed, retrying: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = inner.shutdown.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// Hang up on the server and dial again.
    pub async fn refresh(&self) {
        if let Some(server) = self.inner.registry.server_id().await {
            self.demote("refresh requested");
            let hang_up = Duration::from_millis(self.inner.timing.hang_up_timeout_ms);
            if tokio::time::timeout(hang_up, self.inner.link.hang_up(server)).await.is_err() {
                tracing::warn!(%server, "conn: hang up timed out");
            }
        }
        self.spawn_connect();
    }

    /// Restart the transport and re-seed it from the registry.
    pub async fn reset_node(&self) {
        self.demote("transport reset");
        self.inner.link.reset().await;
        if let Some(server) = self.inner.registry.server_id().await {
            self.inner
                .link
                .add_addresses(server, self.inner.registry.all_multiaddrs().await)
                .await;
        }
        self.spawn_connect();
    }

    // ========================================================================
    // Liveness and discovery
    // ========================================================================

    /// Ping the server while connected. Consecutive failures stretch the
    /// interval linearly; reaching the limit demotes and redials.
    pub async fn run_liveness(&self) {
        let interval = self.inner.timing.liveness_interval();
        let limit = self.inner.timing.ping_failure_limit.max(1);
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval * (failures + 1)) => {}
                _ = self.inner.shutdown.cancelled() => return,
            }
            if self.status() != ConnectionStatus::Connected {
                failures = 0;
                continue;
            }
            let Some(server) = self.inner.registry.server_id().await else {
                continue;
            };
            match bounded(self.inner.timing.dial_timeout(), self.inner.link.ping(server)).await {
                Ok(rtt) => {
                    tracing::trace!(%server, ?rtt, "conn: ping ok");
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    tracing::debug!(%server, failures, "conn: ping failed: {e}");
                    if failures >= limit {
                        failures = 0;
                        self.demote("ping failures");
                        self.spawn_connect();
                    }
                }
            }
        }
    }

    /// Re-probe the registry once the first connection is up, then on every
    /// refresh interval while connected. Evictions and new latencies are
    /// persisted by the registry.
    pub async fn run_stats_refresh(&self) {
        let interval = self.inner.timing.stats_refresh();
        let mut status = self.watch_status();
        loop {
            let connected = tokio::select! {
                r = status.wait_for(|s| *s == ConnectionStatus::Connected) => r.is_ok(),
                _ = self.inner.shutdown.cancelled() => false,
            };
            if !connected {
                return;
            }
            match self.inner.registry.refresh_stats().await {
                Ok(evicted) => {
                    let count = self.inner.registry.len().await;
                    tracing::info!(evicted, count, "conn: bootstrap stats refreshed");
                    self.publish(ClientEvent::AddressCount(count));
                }
                Err(e) => tracing::warn!("conn: bootstrap stats refresh failed: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.inner.shutdown.cancelled() => return,
            }
        }
    }

    /// React to transport events: dial on first sighting of the server and
    /// redial when its last connection closes.
    pub async fn run_discovery(&self, mut net: broadcast::Receiver<NetEvent>) {
        loop {
            let event = tokio::select! {
                ev = net.recv() => ev,
                _ = self.inner.shutdown.cancelled() => return,
            };
            let event = match event {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "conn: net events lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            let server = self.inner.registry.server_id().await;
            match event {
                NetEvent::PeerDiscovered { peer_id } if Some(peer_id) == server => {
                    if self.status() != ConnectionStatus::Connected {
                        tracing::info!(%peer_id, "conn: server discovered, dialling");
                        self.spawn_connect();
                    }
                }
                NetEvent::ConnectionClosed { peer_id, remaining: 0 } if Some(peer_id) == server => {
                    self.demote("connection closed");
                    self.spawn_connect();
                }
                _ => {}
            }
        }
    }

    fn arm_watchdog(&self) {
        if self.inner.watchdog_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let limit = Duration::from_millis(self.inner.timing.connecting_watchdog_ms);
        tokio::spawn(async move {
            let mut rx = this.watch_status();
            let connected = tokio::time::timeout(limit, rx.wait_for(|s| *s == ConnectionStatus::Connected))
                .await
                .is_ok_and(|r| r.is_ok());
            if !connected && this.status() == ConnectionStatus::Connecting {
                tracing::warn!(?limit, "conn: still connecting, reporting offline");
                this.set_status(ConnectionStatus::Offline);
            }
            this.inner.watchdog_armed.store(false, Ordering::SeqCst);
        });
    }

    /// Cancelled when the client shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Server peer id, if known.
    pub async fn server_id(&self) -> Option<PeerId> {
        self.inner.registry.server_id().await
    }
}
