//! Swarm task -- owns the libp2p Swarm, dispatches events via channels.
//!
//! All connection management flows through this task. Byte streams bypass it:
//! they are opened and accepted through the `libp2p_stream` control handle.

use burrow_protocol::PING_PROTOCOL;
use libp2p::futures::future::BoxFuture;
use libp2p::futures::{AsyncWriteExt, StreamExt};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{DialError, SwarmEvent};
use libp2p::{identify, identity, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::link::{CircuitListener, PeerLink, TransportError};
use crate::raw_stream::RawStream;

// ============================================================================
// Behaviour definition
// ============================================================================

#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct BurrowBehaviour {
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub relay_client: relay::client::Behaviour,
    /// Circuit relay hop service, enabled by `server.relay_hop`.
    pub relay_server: Toggle<relay::Behaviour>,
    pub stream: libp2p_stream::Behaviour,
}

// ============================================================================
// Commands (inbound to swarm task)
// ============================================================================

pub enum SwarmCommand {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    AddAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    },
    HangUp {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    /// Close every connection and fail every pending dial.
    Reset {
        reply: oneshot::Sender<()>,
    },
    /// Dial each address without a peer condition; connections found this way
    /// surface as `PeerDiscovered`.
    Bootstrap {
        addrs: Vec<Multiaddr>,
    },
    /// Reserve a circuit through `relay` (a full multiaddr ending in `/p2p/<relay>`).
    ListenOnRelay {
        relay: Multiaddr,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
}

// ============================================================================
// Events (outbound from swarm task)
// ============================================================================

#[derive(Debug, Clone)]
pub enum NetEvent {
    ConnectionEstablished { peer_id: PeerId, addr: Multiaddr },
    ConnectionClosed { peer_id: PeerId, remaining: u32 },
    DialFailure { peer_id: Option<PeerId> },
    /// First sighting of a peer this session.
    PeerDiscovered { peer_id: PeerId },
    ListenAddr { addr: Multiaddr },
    ExpiredListenAddr { addr: Multiaddr },
    RelayReserved { relay: PeerId },
}

// ============================================================================
// Build swarm
// ============================================================================

pub fn build_swarm(
    keypair: identity::Keypair,
    listen_addrs: &[Multiaddr],
    relay_hop: bool,
) -> Result<Swarm<BurrowBehaviour>, Box<dyn std::error::Error + Send + Sync>> {
    let peer_id = PeerId::from(keypair.public());

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default().nodelay(true), noise::Config::new, yamux::Config::default)?
        .with_dns()?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| BurrowBehaviour {
            ping: ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(15))),
            identify: identify::Behaviour::new(identify::Config::new(
                "/burrow/id/1".into(),
                key.public(),
            )),
            relay_client,
            relay_server: Toggle::from(
                relay_hop.then(|| relay::Behaviour::new(key.public().to_peer_id(), relay::Config::default())),
            ),
            stream: libp2p_stream::Behaviour::new(),
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(120)))
        .build();

    for addr in listen_addrs {
        swarm.listen_on(addr.clone())?;
    }

    tracing::info!(%peer_id, relay_hop, "swarm built");
    Ok(swarm)
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable front door to a running swarm task.
#[derive(Clone)]
pub struct SwarmHandle {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    control: libp2p_stream::Control,
    events: broadcast::Sender<NetEvent>,
    ping_lock: std::sync::Arc<Mutex<()>>,
}

impl SwarmHandle {
    pub fn new(
        local_peer_id: PeerId,
        cmd_tx: mpsc::Sender<SwarmCommand>,
        control: libp2p_stream::Control,
        events: broadcast::Sender<NetEvent>,
    ) -> Self {
        Self {
            local_peer_id,
            cmd_tx,
            control,
            events,
            ping_lock: Default::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }

    pub fn control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    pub async fn bootstrap(&self, addrs: Vec<Multiaddr>) -> Result<(), TransportError> {
        self.cmd_tx
            .send(SwarmCommand::Bootstrap { addrs })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub async fn listen_on_relay(&self, relay: Multiaddr) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::ListenOnRelay { relay, reply })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        rx.await.map_err(|_| TransportError::ChannelClosed)?
    }

    pub async fn is_connected(&self, peer: PeerId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(SwarmCommand::IsConnected { peer, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

impl PeerLink for SwarmHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            self.cmd_tx
                .send(SwarmCommand::Dial { peer, addrs, reply })
                .await
                .map_err(|_| TransportError::ChannelClosed)?;
            rx.await.map_err(|_| TransportError::ChannelClosed)?
        })
    }

    fn hang_up(&self, peer: PeerId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            if self.cmd_tx.send(SwarmCommand::HangUp { peer, reply }).await.is_ok() {
                let _ = rx.await;
            }
        })
    }

    fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.cmd_tx.send(SwarmCommand::AddAddresses { peer, addrs }).await;
        })
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            if self.cmd_tx.send(SwarmCommand::Reset { reply }).await.is_ok() {
                let _ = rx.await;
            }
        })
    }

    fn ping(&self, peer: PeerId) -> BoxFuture<'_, Result<Duration, TransportError>> {
        Box::pin(async move {
            let _serial = self.ping_lock.lock().await;
            let mut control = self.control.clone();
            let mut stream = control
                .open_stream(peer, StreamProtocol::new(PING_PROTOCOL))
                .await
                .map_err(|e| TransportError::Ping(e.to_string()))?;
            let rtt = crate::ping::ping_once(&mut stream)
                .await
                .map_err(|e| TransportError::Ping(e.to_string()))?;
            let _ = stream.close().await;
            Ok(rtt)
        })
    }

    fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> BoxFuture<'_, Result<RawStream, TransportError>> {
        Box::pin(async move {
            let mut control = self.control.clone();
            let stream = control
                .open_stream(peer, protocol.clone())
                .await
                .map_err(|e| TransportError::OpenStream(e.to_string()))?;
            Ok(RawStream::from_libp2p(stream, protocol))
        })
    }
}

impl CircuitListener for SwarmHandle {
    fn listen_on_relay(&self, relay: Multiaddr) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(SwarmHandle::listen_on_relay(self, relay))
    }
}

/// Start the swarm loop in the background and return its handle.
pub fn spawn_swarm(
    mut swarm: Swarm<BurrowBehaviour>,
    shutdown: broadcast::Receiver<()>,
) -> (SwarmHandle, tokio::task::JoinHandle<()>) {
    let local = *swarm.local_peer_id();
    let control = swarm.behaviour_mut().stream.new_control();
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(256);
    let handle = SwarmHandle::new(local, cmd_tx, control, event_tx.clone());
    let task = tokio::spawn(run_swarm_loop(swarm, cmd_rx, event_tx, shutdown));
    (handle, task)
}

// ============================================================================
// Run loop
// ============================================================================

/// Run the swarm event loop until shutdown or until every command sender is
/// dropped.
pub async fn run_swarm_loop(
    mut swarm: Swarm<BurrowBehaviour>,
    mut cmd_rx: mpsc::Receiver<SwarmCommand>,
    event_tx: broadcast::Sender<NetEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut address_book: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), TransportError>>>> =
        HashMap::new();
    let mut discovered: HashSet<PeerId> = HashSet::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    SwarmCommand::Dial { peer, addrs, reply } => {
                        let order = dial_order(&address_book, peer, &addrs);
                        remember(&mut address_book, peer, addrs);
                        if swarm.is_connected(&peer) {
                            let _ = reply.send(Ok(()));
                            continue;
                        }
                        tracing::debug!(%peer, addrs = order.len(), "net: dialling");
                        let opts = DialOpts::peer_id(peer)
                            .addresses(order)
                            .condition(PeerCondition::DisconnectedAndNotDialing)
                            .build();
                        match swarm.dial(opts) {
                            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                                pending_dials.entry(peer).or_default().push(reply);
                            }
                            Err(e) => {
                                tracing::warn!(%peer, "net: dial failed: {e}");
                                let _ = reply.send(Err(TransportError::Dial(e.to_string())));
                            }
                        }
                    }
                    SwarmCommand::AddAddresses { peer, addrs } => {
                        remember(&mut address_book, peer, addrs);
                    }
                    SwarmCommand::HangUp { peer, reply } => {
                        tracing::debug!(%peer, "net: hanging up");
                        let _ = swarm.disconnect_peer_id(peer);
                        let _ = reply.send(());
                    }
                    SwarmCommand::Reset { reply } => {
                        let peers: Vec<PeerId> = swarm.connected_peers().copied().collect();
                        tracing::info!(connections = peers.len(), "net: resetting node");
                        for peer in peers {
                            let _ = swarm.disconnect_peer_id(peer);
                        }
                        for (_, waiters) in pending_dials.drain() {
                            for w in waiters {
                                let _ = w.send(Err(TransportError::Dial("node reset".into())));
                            }
                        }
                        let _ = reply.send(());
                    }
                    SwarmCommand::Bootstrap { addrs } => {
                        for addr in addrs {
                            if let Err(e) = swarm.dial(addr.clone()) {
                                tracing::debug!(%addr, "net: bootstrap dial failed: {e}");
                            }
                        }
                    }
                    SwarmCommand::ListenOnRelay { relay, reply } => {
                        let circuit = relay.with(Protocol::P2pCircuit);
                        let result = swarm
                            .listen_on(circuit.clone())
                            .map(|_| ())
                            .map_err(|e| TransportError::Dial(e.to_string()));
                        tracing::info!(%circuit, ok = result.is_ok(), "relay: listening through relay");
                        let _ = reply.send(result);
                    }
                    SwarmCommand::IsConnected { peer, reply } => {
                        let _ = reply.send(swarm.is_connected(&peer));
                    }
                }
            }

            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        tracing::info!(%address, "listening");
                        let _ = event_tx.send(NetEvent::ListenAddr { addr: address });
                    }
                    SwarmEvent::ExpiredListenAddr { address, .. } => {
                        let _ = event_tx.send(NetEvent::ExpiredListenAddr { addr: address });
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
                        let addr = endpoint.get_remote_address().clone();
                        let direction = if endpoint.is_dialer() { "outbound" } else { "inbound" };
                        tracing::info!(
                            %peer_id,
                            %addr,
                            direction,
                            connections = num_established.get(),
                            "net: connection established"
                        );
                        for w in pending_dials.remove(&peer_id).unwrap_or_default() {
                            let _ = w.send(Ok(()));
                        }
                        if discovered.insert(peer_id) {
                            let _ = event_tx.send(NetEvent::PeerDiscovered { peer_id });
                        }
                        let _ = event_tx.send(NetEvent::ConnectionEstablished { peer_id, addr });
                    }
                    SwarmEvent::ConnectionClosed { peer_id, num_established, cause, .. } => {
                        tracing::info!(
                            %peer_id,
                            remaining = num_established,
                            cause = cause.as_ref().map(|c| format!("{c}")).as_deref().unwrap_or("clean"),
                            "net: connection closed"
                        );
                        let _ = event_tx.send(NetEvent::ConnectionClosed { peer_id, remaining: num_established });
                    }
                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        tracing::debug!(peer = ?peer_id, error = %error, "net: outgoing connection failed");
                        if let Some(peer) = peer_id {
                            if !swarm.is_connected(&peer) {
                                for w in pending_dials.remove(&peer).unwrap_or_default() {
                                    let _ = w.send(Err(TransportError::Dial(error.to_string())));
                                }
                            }
                        }
                        let _ = event_tx.send(NetEvent::DialFailure { peer_id });
                    }
                    SwarmEvent::Behaviour(BurrowBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                        tracing::debug!(
                            %peer_id,
                            agent = info.agent_version,
                            listen_addrs = info.listen_addrs.len(),
                            "net: identify received"
                        );
                        if discovered.insert(peer_id) {
                            let _ = event_tx.send(NetEvent::PeerDiscovered { peer_id });
                        }
                    }
                    SwarmEvent::Behaviour(BurrowBehaviourEvent::RelayClient(
                        relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
                    )) => {
                        tracing::info!(relay = %relay_peer_id, "relay: reservation accepted");
                        let _ = event_tx.send(NetEvent::RelayReserved { relay: relay_peer_id });
                    }
                    _ => {}
                }
            }

            _ = shutdown.recv() => {
                tracing::info!(pending_dials = pending_dials.len(), "net: swarm shutting down");
                break;
            }
        }
    }
}

fn remember(book: &mut HashMap<PeerId, Vec<Multiaddr>>, peer: PeerId, addrs: Vec<Multiaddr>) {
    let known = book.entry(peer).or_default();
    for addr in addrs {
        if !known.contains(&addr) {
            known.push(addr);
        }
    }
}

/// Addresses for one dial: the caller's list in its given order, or the
/// whole book when the caller passed none.
fn dial_order(book: &HashMap<PeerId, Vec<Multiaddr>>, peer: PeerId, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    if addrs.is_empty() {
        return book.get(&peer).cloned().unwrap_or_default();
    }
    let mut order: Vec<Multiaddr> = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if !order.contains(addr) {
            order.push(addr.clone());
        }
    }
    order
}
