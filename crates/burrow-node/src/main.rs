//! Burrow Node -- P2P request tunnel, server and client in one binary.
//!
//! Usage:
//!   burrow-node serve                      # Home peer: protocol handlers, relays, info API
//!   burrow-node connect                    # Client: dial the home peer, run the local gateway
//!   burrow-node ping <multiaddr>           # Liveness ping
//!   burrow-node dial <multiaddr>           # Open a stream and dump units as hex
//!   burrow-node identity                   # Show node identity

use burrow_node::config::NodeConfig;
use burrow_node::identity::NodeIdentity;
use burrow_node::link::PeerLink;
use burrow_node::server::{self, Fetcher, HttpRelayDirectory, NodeAddresses, OverrideResolver, RelayManager, ServerContext, StaticOverlay};
use burrow_node::swarm_task::{build_swarm, spawn_swarm, SwarmHandle};
use burrow_node::{client, direct_query, expand_tilde, gateway, parse_listen_addr};

use anyhow::Context;
use burrow_api::AppState;
use burrow_bootstrap::{Registry, TcpProber};
use burrow_protocol::{TunnelTiming, HEARTBEAT_PROTOCOL};
use burrow_storage::{MigrationRunner, SqliteStorage, Storage};
use clap::{Parser, Subcommand};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "burrow-node", about = "Burrow P2P request tunnel node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.burrow/config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the home peer (default)
    Serve,
    /// Run as a client of the home peer and serve the local gateway
    Connect,
    /// Ping a peer
    Ping {
        /// Full multiaddr ending in /p2p/<peer id>
        addr: String,
    },
    /// Open a stream and print every received unit as hex
    Dial {
        /// Full multiaddr ending in /p2p/<peer id>
        addr: String,
        #[arg(long, default_value = HEARTBEAT_PROTOCOL)]
        protocol: String,
    },
    /// Show or generate node identity
    Identity,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "burrow_node=info,burrow_bootstrap=info,burrow_api=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Serve) | None => run_server(cfg).await?,
        Some(Commands::Connect) => run_client(cfg).await?,
        Some(Commands::Ping { addr }) => ping(&cfg, &addr).await?,
        Some(Commands::Dial { addr, protocol }) => dial(&cfg, &addr, protocol).await?,
        Some(Commands::Identity) => {
            let key_path = expand_tilde(&cfg.node.identity_key);
            let identity = NodeIdentity::load_or_create(&key_path)?;
            println!("Peer ID: {}", identity.peer_id());
            println!("Key file: {}", key_path.display());
        }
    }

    Ok(())
}

fn open_storage(cfg: &NodeConfig) -> anyhow::Result<Arc<dyn Storage>> {
    let db_path = expand_tilde(&cfg.node.database);
    let storage = SqliteStorage::open(&db_path)?;
    let applied = MigrationRunner::with_builtin().run(&storage)?;
    tracing::info!(db = %db_path.display(), ?applied, "storage opened");
    Ok(Arc::new(storage))
}

fn listen_addrs(cfg: &NodeConfig) -> anyhow::Result<Vec<Multiaddr>> {
    cfg.node.listen_addrs.iter().map(|a| parse_listen_addr(a)).collect()
}

fn peer_of(addr: &Multiaddr) -> anyhow::Result<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer)) => Ok(peer),
        _ => anyhow::bail!("{addr} does not end in /p2p/<peer id>"),
    }
}

async fn run_server(cfg: NodeConfig) -> anyhow::Result<()> {
    let key_path = expand_tilde(&cfg.node.identity_key);
    let identity = NodeIdentity::load_or_create(&key_path)?;
    let peer_id = *identity.peer_id();
    let timing = cfg.timing;
    tracing::info!(%peer_id, version = env!("CARGO_PKG_VERSION"), "starting burrow-node server");

    let _storage = open_storage(&cfg)?;

    let swarm = build_swarm(identity.keypair(), &listen_addrs(&cfg)?, cfg.server.relay_hop)
        .map_err(|e| anyhow::anyhow!("swarm build failed: {e}"))?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown = CancellationToken::new();
    let (handle, swarm_task) = spawn_swarm(swarm, shutdown_tx.subscribe());
    let handle = Arc::new(handle);

    let addresses = Arc::new(NodeAddresses::new(
        peer_id,
        cfg.server.local_addr.as_deref(),
        cfg.server.public_addr.as_deref(),
    )?);
    tokio::spawn(addresses.clone().track(handle.subscribe()));

    let open_relays = !addresses.has_public() || cfg.server.force_relay_open;
    let relays = Arc::new(RelayManager::new(
        handle.clone(),
        handle.clone(),
        Arc::new(HttpRelayDirectory::new(reqwest::Client::new())),
        open_relays,
        timing,
        shutdown.clone(),
    ));
    let (found_tx, found_rx) = mpsc::channel(64);
    tokio::spawn(relays.clone().run(found_rx));

    let localhost: IpAddr = cfg
        .server
        .fetch_localhost_ip
        .parse()
        .context("server.fetch_localhost_ip")?;
    let resolver = OverrideResolver::new(
        localhost,
        cfg.server.overlay_suffix.clone(),
        cfg.server.overlay_alias.clone(),
        Arc::new(StaticOverlay::default()),
    );
    let fetcher = Fetcher::new(resolver, Duration::from_millis(timing.attempt_timeout_ms), timing.chunk_size)?;
    let ctx = Arc::new(ServerContext {
        fetcher: Arc::new(fetcher),
        relays: relays.clone(),
        addresses: addresses.clone(),
        heartbeat_interval: Duration::from_millis(cfg.server.heartbeat_interval_ms),
        chunk_size: timing.chunk_size,
    });
    let handlers = server::spawn_handlers(handle.control(), ctx, shutdown.clone())
        .map_err(|e| anyhow::anyhow!("protocol already registered: {e}"))?;

    let relays_for_status = relays.clone();
    let state = Arc::new(AppState {
        peer_id: peer_id.to_string(),
        start_time: std::time::Instant::now(),
        addresses,
        relays_found: Some(found_tx),
        active_relays_fn: Some(Box::new(move || {
            let relays = relays_for_status.clone();
            Box::pin(async move { relays.active_relays() })
        })),
    });
    let listener = tokio::net::TcpListener::bind(&cfg.server.api_addr).await?;
    tracing::info!(addr = %cfg.server.api_addr, "API listening (HTTP)");
    let api_shutdown = shutdown.clone();
    let api = tokio::spawn(async move {
        axum::serve(listener, burrow_api::router(state))
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await
            .ok();
    });

    tracing::info!(relays_open = open_relays, "all tasks spawned, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    shutdown.cancel();
    let _ = shutdown_tx.send(());

    for task in handlers {
        let _ = task.await;
    }
    let _ = tokio::join!(swarm_task, api);
    tracing::info!("shutdown complete");
    Ok(())
}

async fn run_client(cfg: NodeConfig) -> anyhow::Result<()> {
    let timing: TunnelTiming = cfg.timing;
    let storage = open_storage(&cfg)?;

    // Clients use a throwaway identity
    let identity = NodeIdentity::generate();
    let swarm = build_swarm(identity.keypair(), &[], false).map_err(|e| anyhow::anyhow!("swarm build failed: {e}"))?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown = CancellationToken::new();
    let (handle, swarm_task) = spawn_swarm(swarm, shutdown_tx.subscribe());
    let handle = Arc::new(handle);
    tracing::info!(peer_id = %identity.peer_id(), "starting burrow-node client");

    let registry = Arc::new(Registry::new(storage, Arc::new(TcpProber), timing));
    let client = Arc::new(client::Client::new(handle.clone(), registry.clone(), timing, shutdown.clone()));
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "client: event");
        }
    });

    let direct = direct_query::query_info(
        cfg.client.api_root.as_deref(),
        Duration::from_millis(timing.stats_timeout_ms),
    )
    .await;
    client
        .start(direct.as_ref(), cfg.client.server_host.as_deref(), Some(handle.subscribe()))
        .await
        .context("no usable bootstrap address; set client.api_root or seed the cache")?;
    if let Err(e) = handle.bootstrap(registry.ranked_multiaddrs().await).await {
        tracing::warn!("net: bootstrap failed: {e}");
    }

    let (_control_tx, control_rx) = mpsc::channel(16);
    tokio::spawn(client.clone().run_control(control_rx));

    let gw = Arc::new(gateway::Gateway::new(client.requests(), client.websockets()));
    let listener = tokio::net::TcpListener::bind(&cfg.client.gateway_addr).await?;
    tracing::info!(addr = %cfg.client.gateway_addr, "gateway listening");
    let gw_shutdown = shutdown.clone();
    let gw_task = tokio::spawn(async move {
        axum::serve(listener, gateway::router(gw))
            .with_graceful_shutdown(async move { gw_shutdown.cancelled().await })
            .await
            .ok();
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    shutdown.cancel();
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(swarm_task, gw_task);
    Ok(())
}

/// Throwaway swarm connected to the peer at `addr`.
async fn connect_once(cfg: &NodeConfig, addr: &str) -> anyhow::Result<(SwarmHandle, PeerId, broadcast::Sender<()>)> {
    let addr: Multiaddr = addr.parse().context("invalid multiaddr")?;
    let peer = peer_of(&addr)?;
    let swarm = build_swarm(NodeIdentity::generate().keypair(), &[], false)
        .map_err(|e| anyhow::anyhow!("swarm build failed: {e}"))?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (handle, _task) = spawn_swarm(swarm, shutdown_tx.subscribe());
    let timeout = Duration::from_millis(cfg.timing.dial_timeout_ms);
    tokio::time::timeout(timeout, handle.dial(peer, vec![addr]))
        .await
        .map_err(|_| anyhow::anyhow!("dial timed out after {timeout:?}"))??;
    Ok((handle, peer, shutdown_tx))
}

async fn ping(cfg: &NodeConfig, addr: &str) -> anyhow::Result<()> {
    let (handle, peer, shutdown) = connect_once(cfg, addr).await?;
    let rtt = handle.ping(peer).await?;
    println!("{peer}: {} ms", rtt.as_millis());
    let _ = shutdown.send(());
    Ok(())
}

async fn dial(cfg: &NodeConfig, addr: &str, protocol: String) -> anyhow::Result<()> {
    let protocol = StreamProtocol::try_from_owned(protocol).context("invalid protocol id")?;
    let (handle, peer, shutdown) = connect_once(cfg, addr).await?;
    let mut stream = handle.open_stream(peer, protocol.clone()).await?;
    eprintln!("opened {protocol} to {peer}");
    loop {
        tokio::select! {
            unit = stream.read() => match unit {
                Some(unit) => println!("{}", hex::encode(&unit)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    stream.close();
    let _ = shutdown.send(());
    Ok(())
}
