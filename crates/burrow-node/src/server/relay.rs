//! Relay activation and relay announcements.
//!
//! Peer keys reported by the discovery layer are looked up in the relay
//! directory. When this node has no public port mapping (or relays are forced
//! open) the relay is kept alive with a heartbeat stream and a circuit listen
//! address is reserved through it. Clients learn about active relays from the
//! announcement stream.

use burrow_protocol::{TunnelTiming, HEARTBEAT_PROTOCOL};
use bytes::Bytes;
use libp2p::futures::future::BoxFuture;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::heartbeat;
use crate::link::{bounded, CircuitListener, PeerLink};
use crate::raw_stream::RawStream;

/// Maps a discovered peer key to that peer's relay multiaddr.
pub trait RelayDirectory: Send + Sync {
    fn relay_addr(&self, key: &str) -> BoxFuture<'_, Option<Multiaddr>>;
}

/// Asks the peer's own web endpoint on the overlay network.
pub struct HttpRelayDirectory {
    client: reqwest::Client,
}

impl HttpRelayDirectory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// DNS labels are capped at 63 bytes, so long keys span two labels.
    pub fn query_url(key: &str) -> String {
        if key.len() > 63 {
            let (head, tail) = key.split_at(63);
            format!("https://yggdrasil.{head}.{tail}.yg/libp2p.relay")
        } else {
            format!("https://yggdrasil.{key}.yg/libp2p.relay")
        }
    }
}

impl RelayDirectory for HttpRelayDirectory {
    fn relay_addr(&self, key: &str) -> BoxFuture<'_, Option<Multiaddr>> {
        let url = Self::query_url(key);
        Box::pin(async move {
            let response = match self.client.get(&url).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    tracing::debug!(%url, status = %r.status(), "relay: query refused");
                    return None;
                }
                Err(e) => {
                    tracing::debug!(%url, "relay: query failed: {e}");
                    return None;
                }
            };
            let text = response.text().await.ok()?;
            match text.trim().parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(%url, "relay: bad relay address: {e}");
                    None
                }
            }
        })
    }
}

pub struct RelayManager {
    link: Arc<dyn PeerLink>,
    circuits: Arc<dyn CircuitListener>,
    directory: Arc<dyn RelayDirectory>,
    /// No public port mapping, or relays forced open.
    open_relays: bool,
    timing: TunnelTiming,
    /// Relays being kept alive, activated or not.
    tracked: Mutex<BTreeSet<String>>,
    active: Mutex<BTreeSet<String>>,
    activated: broadcast::Sender<String>,
    shutdown: CancellationToken,
}

impl RelayManager {
    pub fn new(
        link: Arc<dyn PeerLink>,
        circuits: Arc<dyn CircuitListener>,
        directory: Arc<dyn RelayDirectory>,
        open_relays: bool,
        timing: TunnelTiming,
        shutdown: CancellationToken,
    ) -> Self {
        let (activated, _) = broadcast::channel(32);
        Self {
            link,
            circuits,
            directory,
            open_relays,
            timing,
            tracked: Mutex::new(BTreeSet::new()),
            active: Mutex::new(BTreeSet::new()),
            activated,
            shutdown,
        }
    }

    /// Circuit address of this node through `relay`.
    pub fn circuit_addr(&self, relay: &str) -> String {
        format!("{relay}/p2p-circuit/p2p/{}", self.link.local_peer_id())
    }

    /// Circuit addresses through every active relay.
    pub fn active_relays(&self) -> Vec<String> {
        let active = match self.active.lock() {
            Ok(a) => a.iter().cloned().collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        active.iter().map(|r| self.circuit_addr(r)).collect()
    }

    /// Circuit addresses of relays activated from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.activated.subscribe()
    }

    /// Consume reported peer keys until the sender side closes.
    pub async fn run(self: Arc<Self>, mut found: mpsc::Receiver<String>) {
        loop {
            let key = tokio::select! {
                k = found.recv() => k,
                _ = self.shutdown.cancelled() => None,
            };
            let Some(key) = key else { break };
            let this = self.clone();
            tokio::spawn(async move { this.handle_found(&key).await });
        }
    }

    pub async fn handle_found(self: &Arc<Self>, key: &str) {
        tracing::debug!(key, "relay: peer key found");
        match self.directory.relay_addr(key).await {
            Some(relay) => {
                self.add_relay(relay);
            }
            None => tracing::debug!(key, "relay: no relay for key"),
        }
    }

    /// Start keeping `relay` alive. Returns false if it was skipped.
    pub fn add_relay(self: &Arc<Self>, relay: Multiaddr) -> bool {
        if !self.open_relays {
            tracing::debug!(%relay, "relay: public mapping in place, not opening relay");
            return false;
        }
        let Some(Protocol::P2p(peer)) = relay.iter().last() else {
            tracing::warn!(%relay, "relay: address has no peer id");
            return false;
        };
        let key = relay.to_string();
        let inserted = match self.tracked.lock() {
            Ok(mut tracked) => tracked.insert(key),
            Err(_) => false,
        };
        if !inserted {
            return false;
        }
        tracing::info!(%relay, "relay: opening relay");
        tokio::spawn(self.clone().keep_alive(relay, peer));
        true
    }

    async fn keep_alive(self: Arc<Self>, relay: Multiaddr, peer: PeerId) {
        let poll = Duration::from_millis(self.timing.active_relay_poll_ms);
        let protocol = StreamProtocol::new(HEARTBEAT_PROTOCOL);
        let mut activated = false;
        while !self.shutdown.is_cancelled() {
            if let Err(e) = bounded(self.timing.dial_timeout(), self.link.dial(peer, vec![relay.clone()])).await {
                tracing::debug!(%relay, "relay: dial failed: {e}");
            }
            match bounded(self.timing.dial_timeout(), self.link.open_stream(peer, protocol.clone())).await {
                Ok(stream) => {
                    if !activated {
                        activated = self.activate(&relay).await;
                    }
                    tokio::select! {
                        end = heartbeat::watch(stream, self.timing.heartbeat_timeout()) => {
                            tracing::debug!(%relay, ?end, "relay: keep-alive stream ended");
                        }
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => tracing::debug!(%relay, "relay: keep-alive stream failed: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        let key = relay.to_string();
        if let Ok(mut active) = self.active.lock() {
            active.remove(&key);
        }
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.remove(&key);
        }
    }

    async fn activate(&self, relay: &Multiaddr) -> bool {
        if let Err(e) = self.circuits.listen_on_relay(relay.clone()).await {
            tracing::warn!(%relay, "relay: reservation failed: {e}");
            return false;
        }
        let key = relay.to_string();
        if let Ok(mut active) = self.active.lock() {
            active.insert(key.clone());
        }
        tracing::info!(%relay, "relay: activated");
        let _ = self.activated.send(self.circuit_addr(&key));
        true
    }
}

/// Announce this node's public address and every active relay circuit, then
/// each newly activated one, until the client closes the stream.
pub async fn announce(mut stream: RawStream, relays: Arc<RelayManager>, public_addr: Option<String>) {
    let mut activated = relays.subscribe();
    let initial = public_addr.into_iter().chain(relays.active_relays());
    for addr in initial {
        if !stream.write(Bytes::from(addr)) {
            return;
        }
    }
    loop {
        tokio::select! {
            next = activated.recv() => match next {
                Ok(addr) => {
                    if !stream.write(Bytes::from(addr)) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "relay: announcements lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            unit = stream.read() => {
                if unit.is_none() {
                    break;
                }
            }
        }
    }
    stream.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeLink;
    use burrow_protocol::{DEFAULT_TIMING, RELAY_PROTOCOL};
    use std::collections::HashMap;

    struct MapDirectory(HashMap<String, Multiaddr>);

    impl RelayDirectory for MapDirectory {
        fn relay_addr(&self, key: &str) -> BoxFuture<'_, Option<Multiaddr>> {
            let addr = self.0.get(key).cloned();
            Box::pin(async move { addr })
        }
    }

    fn relay_addr() -> Multiaddr {
        format!("/ip4/10.0.0.9/tcp/4001/p2p/{}", PeerId::random()).parse().unwrap()
    }

    fn manager(link: Arc<FakeLink>, open: bool, relay: &Multiaddr) -> Arc<RelayManager> {
        let mut map = HashMap::new();
        map.insert("key-1".to_string(), relay.clone());
        Arc::new(RelayManager::new(
            link.clone(),
            link,
            Arc::new(MapDirectory(map)),
            open,
            DEFAULT_TIMING,
            CancellationToken::new(),
        ))
    }

    /// Serve heartbeats for every keep-alive stream.
    fn serve_heartbeats(link: &FakeLink) {
        let mut incoming = link.serve(StreamProtocol::new(HEARTBEAT_PROTOCOL));
        tokio::spawn(async move {
            while let Some(stream) = incoming.recv().await {
                tokio::spawn(heartbeat::beat(stream, Duration::from_secs(5)));
            }
        });
    }

    #[test]
    fn test_query_url_splits_long_keys() {
        let key = "a".repeat(64);
        let url = HttpRelayDirectory::query_url(&key);
        assert_eq!(url, format!("https://yggdrasil.{}.a.yg/libp2p.relay", "a".repeat(63)));
        assert_eq!(HttpRelayDirectory::query_url("abc"), "https://yggdrasil.abc.yg/libp2p.relay");
    }

    #[tokio::test]
    async fn test_found_key_activates_relay() {
        let link = Arc::new(FakeLink::new());
        serve_heartbeats(&link);
        let relay = relay_addr();
        let relays = manager(link.clone(), true, &relay);
        let mut activated = relays.subscribe();

        relays.handle_found("key-1").await;
        let circuit = activated.recv().await.unwrap();
        assert_eq!(circuit, format!("{relay}/p2p-circuit/p2p/{}", link.local));
        assert_eq!(relays.active_relays(), vec![circuit]);
        assert_eq!(link.circuits.lock().unwrap().as_slice(), &[relay]);
    }

    #[tokio::test]
    async fn test_public_mapping_skips_relays() {
        let link = Arc::new(FakeLink::new());
        let relay = relay_addr();
        let relays = manager(link.clone(), false, &relay);
        assert!(!relays.add_relay(relay));
        relays.handle_found("unknown").await;
        assert!(relays.active_relays().is_empty());
        assert!(link.circuits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_relay_tracked_once() {
        let link = Arc::new(FakeLink::new());
        serve_heartbeats(&link);
        let relay = relay_addr();
        let relays = manager(link, true, &relay);
        assert!(relays.add_relay(relay.clone()));
        assert!(!relays.add_relay(relay));
    }

    #[tokio::test]
    async fn test_announce_self_then_relays() {
        let link = Arc::new(FakeLink::new());
        serve_heartbeats(&link);
        let first = relay_addr();
        let relays = manager(link.clone(), true, &first);
        let mut activated = relays.subscribe();
        relays.add_relay(first.clone());
        activated.recv().await.unwrap();

        let (mut client, server) = RawStream::pair(StreamProtocol::new(RELAY_PROTOCOL));
        let public = "/ip4/203.0.113.5/tcp/9474/p2p/12D3KooWself".to_string();
        tokio::spawn(announce(server, relays.clone(), Some(public.clone())));

        assert_eq!(client.read().await.unwrap(), Bytes::from(public));
        assert_eq!(client.read().await.unwrap(), Bytes::from(relays.circuit_addr(&first.to_string())));

        let second = relay_addr();
        relays.add_relay(second.clone());
        assert_eq!(client.read().await.unwrap(), Bytes::from(relays.circuit_addr(&second.to_string())));
    }
}
