//! Test harness for in-process burrow-node integration tests.
//!
//! Provides TestServer (home peer with handlers and info API), TestClient
//! (client facade over a real swarm) and a local upstream HTTP/WebSocket
//! server, all on ephemeral ports in the same tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::routing::{get, post};
use axum::Router;
use burrow_api::AppState;
use burrow_bootstrap::{Registry, TcpProber};
use burrow_node::client::Client;
use burrow_node::events::ConnectionStatus;
use burrow_node::identity::NodeIdentity;
use burrow_node::server::{
    self, Fetcher, HttpRelayDirectory, NodeAddresses, OverrideResolver, RelayManager, ServerContext,
    StaticOverlay,
};
use burrow_node::swarm_task::{build_swarm, spawn_swarm, SwarmHandle};
use burrow_protocol::{TunnelTiming, DEFAULT_TIMING};
use burrow_storage::{MigrationRunner, SqliteStorage, Storage};
use libp2p::futures::{SinkExt, StreamExt};
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Timing tuned for tests: small chunks so bodies span many of them.
pub fn test_timing() -> TunnelTiming {
    TunnelTiming {
        chunk_size: 4 * 1024,
        attempt_timeout_ms: 10_000,
        ..DEFAULT_TIMING
    }
}

async fn bind(app: Router) -> anyhow::Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(addr)
}

/// Upstream the server fetches from: `/hello`, `/echo`, `/teapot`, `/ws`.
pub async fn spawn_upstream() -> anyhow::Result<String> {
    let app = Router::new()
        .route("/hello", get(|| async { "hello from upstream" }))
        .route("/echo", post(|body: Bytes| async move { body }))
        .route(
            "/teapot",
            get(|| async { (axum::http::StatusCode::IM_A_TEAPOT, "short and stout") }),
        )
        .route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move {
                ws.on_upgrade(|mut socket| async move {
                    while let Some(Ok(msg)) = socket.next().await {
                        match msg {
                            Message::Text(_) | Message::Binary(_) => {
                                if socket.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Message::Close(_) => return,
                            _ => {}
                        }
                    }
                })
            }),
        );
    bind(app).await
}

/// A running home peer: swarm, protocol handlers, relay manager, info API.
pub struct TestServer {
    pub peer_id: PeerId,
    pub listen_addr: Multiaddr,
    pub api_root: String,
    pub relays: Arc<RelayManager>,
    shutdown: CancellationToken,
    shutdown_tx: broadcast::Sender<()>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(false).await
    }

    /// `relay_hop` also serves circuit reservations for other peers.
    pub async fn start_with(relay_hop: bool) -> anyhow::Result<Self> {
        let timing = test_timing();
        let identity = NodeIdentity::generate();
        let peer_id = *identity.peer_id();

        let listen: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse()?;
        let mut swarm = build_swarm(identity.keypair(), &[listen], relay_hop)
            .map_err(|e| anyhow::anyhow!("swarm build failed: {e}"))?;

        // Wait for NewListenAddr to get actual port
        let listen_addr = loop {
            if let Some(libp2p::swarm::SwarmEvent::NewListenAddr { address, .. }) = swarm.next().await {
                break address;
            }
        };

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown = CancellationToken::new();
        let (handle, _task) = spawn_swarm(swarm, shutdown_tx.subscribe());
        let handle = Arc::new(handle);

        let addresses = Arc::new(NodeAddresses::new(peer_id, None, None)?);
        addresses.add_listen(listen_addr.clone());
        tokio::spawn(addresses.clone().track(handle.subscribe()));

        let relays = Arc::new(RelayManager::new(
            handle.clone(),
            handle.clone(),
            Arc::new(HttpRelayDirectory::new(reqwest::Client::new())),
            true,
            timing,
            shutdown.clone(),
        ));
        let (found_tx, found_rx) = mpsc::channel(16);
        tokio::spawn(relays.clone().run(found_rx));

        let resolver = OverrideResolver::new(
            "127.0.0.1".parse()?,
            ".yg",
            None,
            Arc::new(StaticOverlay::default()),
        );
        let fetcher = Fetcher::new(resolver, Duration::from_secs(5), timing.chunk_size)?;
        let ctx = Arc::new(ServerContext {
            fetcher: Arc::new(fetcher),
            relays: relays.clone(),
            addresses: addresses.clone(),
            heartbeat_interval: Duration::from_millis(500),
            chunk_size: timing.chunk_size,
        });
        server::spawn_handlers(handle.control(), ctx, shutdown.clone())
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let state = Arc::new(AppState {
            peer_id: peer_id.to_string(),
            start_time: std::time::Instant::now(),
            addresses,
            relays_found: Some(found_tx),
            active_relays_fn: None,
        });
        let api_addr = bind(burrow_api::router(state)).await?;

        Ok(Self {
            peer_id,
            listen_addr,
            api_root: format!("http://{api_addr}"),
            relays,
            shutdown,
            shutdown_tx,
        })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// A client facade over its own swarm and sqlite-backed registry.
pub struct TestClient {
    pub client: Arc<Client>,
    pub handle: Arc<SwarmHandle>,
    pub storage: Arc<dyn Storage>,
    shutdown: CancellationToken,
    shutdown_tx: broadcast::Sender<()>,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestClient {
    /// Start a client that discovers `server` through its info API.
    pub async fn connect(server: &TestServer) -> anyhow::Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let storage = SqliteStorage::open(&tempdir.path().join("client.db"))?;
        MigrationRunner::with_builtin().run(&storage)?;
        let storage: Arc<dyn Storage> = Arc::new(storage);

        let swarm = build_swarm(NodeIdentity::generate().keypair(), &[], false)
            .map_err(|e| anyhow::anyhow!("swarm build failed: {e}"))?;
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown = CancellationToken::new();
        let (handle, _task) = spawn_swarm(swarm, shutdown_tx.subscribe());
        let handle = Arc::new(handle);

        let timing = test_timing();
        let registry = Arc::new(Registry::new(storage.clone(), Arc::new(TcpProber), timing));
        let client = Arc::new(Client::new(handle.clone(), registry, timing, shutdown.clone()));

        let info = burrow_node::direct_query::query_info(Some(&server.api_root), Duration::from_secs(5)).await;
        anyhow::ensure!(info.is_some(), "info API did not answer");
        client.start(info.as_ref(), None, Some(handle.subscribe())).await?;

        Ok(Self {
            client,
            handle,
            storage,
            shutdown,
            shutdown_tx,
            _tempdir: tempdir,
        })
    }

    pub async fn wait_connected(&self, timeout: Duration) -> anyhow::Result<()> {
        let mut status = self.client.connection().watch_status();
        tokio::time::timeout(timeout, status.wait_for(|s| *s == ConnectionStatus::Connected))
            .await
            .map_err(|_| anyhow::anyhow!("timeout waiting for CONNECTED (now {})", self.client.connection().status()))??;
        Ok(())
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
