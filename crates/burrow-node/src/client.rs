//! Client facade: one connection manager, one stream pool and the tunnels
//! built on them, driven by control messages from the hosting surface.

use burrow_bootstrap::{Registry, RegistryError};
use burrow_protocol::{P2pInfo, TunnelTiming};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::events::{ClientEvent, ControlMessage};
use crate::heartbeat;
use crate::link::PeerLink;
use crate::relay_feed::RelayFeed;
use crate::request_tunnel::RequestTunnel;
use crate::stream_factory::{StreamFactory, StreamPool};
use crate::swarm_task::NetEvent;
use crate::ws_tunnel::WsTunnel;

const EVENT_CAPACITY: usize = 256;

pub struct Client {
    conn: ConnectionManager,
    pool: Arc<StreamPool>,
    requests: Arc<RequestTunnel>,
    websockets: Arc<WsTunnel>,
    relays: Arc<RelayFeed>,
}

impl Client {
    pub fn new(
        link: Arc<dyn PeerLink>,
        registry: Arc<Registry>,
        timing: TunnelTiming,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let conn = ConnectionManager::new(link, registry, timing, events, shutdown);
        let pool = Arc::new(StreamPool::new(StreamFactory::new(conn.clone())));
        let requests = Arc::new(RequestTunnel::new(pool.clone(), conn.watch_status(), timing));
        let websockets = Arc::new(WsTunnel::new(pool.clone(), timing));
        let relays = Arc::new(RelayFeed::new(conn.clone()));
        Self {
            conn,
            pool,
            requests,
            websockets,
            relays,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn pool(&self) -> &Arc<StreamPool> {
        &self.pool
    }

    pub fn requests(&self) -> Arc<RequestTunnel> {
        self.requests.clone()
    }

    pub fn websockets(&self) -> Arc<WsTunnel> {
        self.websockets.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.conn.subscribe()
    }

    /// Load the registry, then start the background activities and the
    /// first dial. `net` feeds discovery-driven dialling when present.
    pub async fn start(
        &self,
        direct: Option<&P2pInfo>,
        server_host: Option<&str>,
        net: Option<broadcast::Receiver<NetEvent>>,
    ) -> Result<(), RegistryError> {
        let registry = self.conn.registry();
        registry.load(direct, server_host).await?;
        self.conn.mark_bootstrapped();
        self.conn.publish(ClientEvent::AddressCount(registry.len().await));

        if let Some(net) = net {
            let conn = self.conn.clone();
            tokio::spawn(async move { conn.run_discovery(net).await });
        }
        let conn = self.conn.clone();
        tokio::spawn(async move { conn.run_liveness().await });
        let conn = self.conn.clone();
        tokio::spawn(async move { conn.run_stats_refresh().await });
        tokio::spawn(self.relays.clone().run());
        tokio::spawn(heartbeat::monitor(self.conn.clone()));

        self.conn.spawn_connect();
        Ok(())
    }

    pub async fn handle(&self, message: ControlMessage) {
        tracing::debug!(?message, "client: control message");
        match message {
            ControlMessage::RefreshConnection => self.conn.refresh().await,
            ControlMessage::OpenWebSocket(ports) => {
                let websockets = self.websockets.clone();
                tokio::spawn(async move {
                    if let Err(e) = websockets.run(ports).await {
                        tracing::debug!("ws: tunnel ended: {e}");
                    }
                });
            }
            ControlMessage::HeartbeatEcho => self.conn.publish(ClientEvent::HeartbeatEcho),
            ControlMessage::Rollback => {
                tracing::info!("client: rollback requested");
                self.conn.publish(ClientEvent::RollbackRequested);
            }
            ControlMessage::RequestStatus => {
                self.conn.publish(ClientEvent::Status(self.conn.status()));
                let count = self.conn.registry().ranked_multiaddrs().await.len();
                self.conn.publish(ClientEvent::AddressCount(count));
            }
        }
    }

    /// Serve control messages until the sender side drops or shutdown.
    pub async fn run_control(self: Arc<Self>, mut rx: mpsc::Receiver<ControlMessage>) {
        let shutdown = self.conn.shutdown_token();
        loop {
            let message = tokio::select! {
                m = rx.recv() => m,
                _ = shutdown.cancelled() => None,
            };
            let Some(message) = message else { break };
            self.handle(message).await;
        }
        tracing::debug!("client: control loop ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConnectionStatus;
    use crate::test_support::{registry_with_server, FakeLink, SwitchProber};
    use crate::ws_tunnel::WsPorts;
    use burrow_protocol::{DEFAULT_TIMING, WEBSOCKET_PROTOCOL};
    use libp2p::{PeerId, StreamProtocol};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    async fn client(link: Arc<FakeLink>) -> Client {
        let (registry, _) = registry_with_server().await;
        Client::new(link, registry, DEFAULT_TIMING, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects() {
        let link = Arc::new(FakeLink::new());
        let c = client(link).await;
        let mut status = c.connection().watch_status();
        c.start(None, None, None).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ConnectionStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        c.connection().shutdown_token().cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_is_reprobed_after_connect() {
        use burrow_bootstrap::{AddOptions, AddressRecord, Latency};
        use burrow_storage::{MemoryStorage, StorageExt, BOOTSTRAP_LIST_KEY};

        let storage = Arc::new(MemoryStorage::new());
        let prober = Arc::new(SwitchProber::new());
        let registry = Arc::new(Registry::new(storage.clone(), prober.clone(), DEFAULT_TIMING));
        let server = PeerId::random();
        let addr = format!("/ip4/10.0.0.2/tcp/9000/p2p/{server}");
        registry.add_address(&addr, AddOptions::default()).await.unwrap();
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);

        let c = Client::new(Arc::new(FakeLink::new()), registry.clone(), DEFAULT_TIMING, CancellationToken::new());
        let mut status = c.connection().watch_status();
        c.start(None, None, None).await.unwrap();
        status.wait_for(|s| *s == ConnectionStatus::Connected).await.unwrap();

        // First connection triggers a refresh pass
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 2);
        let persisted: Vec<AddressRecord> = storage.get_document(BOOTSTRAP_LIST_KEY).unwrap().unwrap();
        assert_eq!(persisted[0].latency, Some(10));

        // The address goes down; the next periodic pass records it
        prober.up.store(false, Ordering::SeqCst);
        tokio::time::sleep(DEFAULT_TIMING.stats_refresh()).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 3);
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].latency, Latency::Unreachable);
        let persisted: Vec<AddressRecord> = storage.get_document(BOOTSTRAP_LIST_KEY).unwrap().unwrap();
        assert_eq!(persisted[0].latency, None);

        c.connection().shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_start_fails_without_addresses() {
        use burrow_storage::MemoryStorage;
        let registry = Arc::new(Registry::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(crate::test_support::UpProber),
            DEFAULT_TIMING,
        ));
        let c = Client::new(Arc::new(FakeLink::new()), registry, DEFAULT_TIMING, CancellationToken::new());
        assert!(c.start(None, None, None).await.is_err());
        assert_eq!(c.connection().status(), ConnectionStatus::Offline);
    }

    #[tokio::test]
    async fn test_control_messages_publish_events() {
        let c = Arc::new(client(Arc::new(FakeLink::new())).await);
        let mut rx = c.subscribe();
        let (tx, control) = mpsc::channel(8);
        let task = tokio::spawn(c.clone().run_control(control));

        tx.send(ControlMessage::RequestStatus).await.unwrap();
        tx.send(ControlMessage::HeartbeatEcho).await.unwrap();
        tx.send(ControlMessage::Rollback).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(
            events,
            vec![
                ClientEvent::Status(ConnectionStatus::Offline),
                ClientEvent::AddressCount(1),
                ClientEvent::HeartbeatEcho,
                ClientEvent::RollbackRequested,
            ]
        );
    }

    #[tokio::test]
    async fn test_open_websocket_opens_tunnel_stream() {
        let link = Arc::new(FakeLink::new());
        let mut incoming = link.serve(StreamProtocol::new(WEBSOCKET_PROTOCOL));
        let c = client(link).await;
        let (ports, _page) = WsPorts::pair();
        c.handle(ControlMessage::OpenWebSocket(ports)).await;
        let server_side = incoming.recv().await.unwrap();
        assert_eq!(server_side.protocol().as_ref(), WEBSOCKET_PROTOCOL);
    }
}
