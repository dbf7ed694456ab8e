//! Server side: one handler per protocol, invoked for every inbound stream.

pub mod relay;
pub mod request;
pub mod websocket;

use burrow_api::AddressSource;
use burrow_protocol::{
    P2pInfo, HEARTBEAT_PROTOCOL, RELAY_PROTOCOL, REQUEST_PROTOCOL, WEBSOCKET_PROTOCOL,
};
use libp2p::futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::heartbeat;
use crate::raw_stream::RawStream;
use crate::swarm_task::NetEvent;

pub use relay::{HttpRelayDirectory, RelayDirectory, RelayManager};
pub use request::{Fetcher, OverlayDns, OverrideResolver, StaticOverlay};

/// This node's reachable addresses, as reported to clients.
pub struct NodeAddresses {
    local_peer: PeerId,
    configured_local: Option<Multiaddr>,
    configured_public: Option<Multiaddr>,
    listening: RwLock<Vec<Multiaddr>>,
}

impl NodeAddresses {
    pub fn new(
        local_peer: PeerId,
        local: Option<&str>,
        public: Option<&str>,
    ) -> Result<Self, libp2p::multiaddr::Error> {
        Ok(Self {
            local_peer,
            configured_local: local.map(str::parse::<Multiaddr>).transpose()?,
            configured_public: public.map(str::parse::<Multiaddr>).transpose()?,
            listening: RwLock::new(Vec::new()),
        })
    }

    /// Whether a public port mapping is in place.
    pub fn has_public(&self) -> bool {
        self.configured_public.is_some()
    }

    fn with_peer(&self, addr: &Multiaddr) -> String {
        match addr.iter().last() {
            Some(Protocol::P2p(_)) => addr.to_string(),
            _ => addr.clone().with(Protocol::P2p(self.local_peer)).to_string(),
        }
    }

    pub fn local(&self) -> Option<String> {
        if let Some(addr) = &self.configured_local {
            return Some(self.with_peer(addr));
        }
        let listening = self.listening.read().ok()?;
        let preferred = listening
            .iter()
            .find(|a| !is_loopback(a))
            .or_else(|| listening.first())?;
        Some(self.with_peer(preferred))
    }

    pub fn public(&self) -> Option<String> {
        self.configured_public.as_ref().map(|a| self.with_peer(a))
    }

    pub fn add_listen(&self, addr: Multiaddr) {
        if addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)) {
            return;
        }
        if let Ok(mut listening) = self.listening.write() {
            if !listening.contains(&addr) {
                listening.push(addr);
            }
        }
    }

    pub fn remove_listen(&self, addr: &Multiaddr) {
        if let Ok(mut listening) = self.listening.write() {
            listening.retain(|a| a != addr);
        }
    }

    /// Follow listen address changes until the event channel closes.
    pub async fn track(self: Arc<Self>, mut events: broadcast::Receiver<NetEvent>) {
        loop {
            match events.recv().await {
                Ok(NetEvent::ListenAddr { addr }) => self.add_listen(addr),
                Ok(NetEvent::ExpiredListenAddr { addr }) => self.remove_listen(&addr),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn is_loopback(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| match p {
        Protocol::Ip4(ip) => ip.is_loopback(),
        Protocol::Ip6(ip) => ip.is_loopback(),
        _ => false,
    })
}

impl AddressSource for NodeAddresses {
    fn p2p_info(&self) -> P2pInfo {
        P2pInfo {
            local_multiaddr: self.local(),
            public_multiaddr: self.public(),
        }
    }
}

/// Everything the protocol handlers share.
pub struct ServerContext {
    pub fetcher: Arc<Fetcher>,
    pub relays: Arc<RelayManager>,
    pub addresses: Arc<NodeAddresses>,
    pub heartbeat_interval: Duration,
    pub chunk_size: usize,
}

/// Register a handler for every protocol. Each accept loop runs until
/// `shutdown` fires.
pub fn spawn_handlers(
    mut control: libp2p_stream::Control,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, libp2p_stream::AlreadyRegistered> {
    let mut tasks = Vec::new();

    let c = ctx.clone();
    tasks.push(accept_loop(&mut control, REQUEST_PROTOCOL, shutdown.clone(), move |s| {
        request::serve(s, c.fetcher.clone())
    })?);

    let chunk_size = ctx.chunk_size;
    tasks.push(accept_loop(&mut control, WEBSOCKET_PROTOCOL, shutdown.clone(), move |s| {
        websocket::serve(s, chunk_size)
    })?);

    let interval = ctx.heartbeat_interval;
    tasks.push(accept_loop(&mut control, HEARTBEAT_PROTOCOL, shutdown.clone(), move |s| {
        heartbeat::beat(s, interval)
    })?);

    let c = ctx;
    tasks.push(accept_loop(&mut control, RELAY_PROTOCOL, shutdown, move |s| {
        relay::announce(s, c.relays.clone(), c.addresses.public())
    })?);

    Ok(tasks)
}

fn accept_loop<F, Fut>(
    control: &mut libp2p_stream::Control,
    protocol: &'static str,
    shutdown: CancellationToken,
    handler: F,
) -> Result<JoinHandle<()>, libp2p_stream::AlreadyRegistered>
where
    F: Fn(RawStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let protocol = StreamProtocol::new(protocol);
    let mut incoming = control.accept(protocol.clone())?;
    Ok(tokio::spawn(async move {
        tracing::info!(%protocol, "server: handler registered");
        loop {
            let next = tokio::select! {
                n = incoming.next() => n,
                _ = shutdown.cancelled() => None,
            };
            let Some((peer, stream)) = next else { break };
            tracing::debug!(%peer, %protocol, "server: inbound stream");
            tokio::spawn(handler(RawStream::from_libp2p(stream, protocol.clone())));
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_prefers_non_loopback_listen_addr() {
        let peer = PeerId::random();
        let addrs = NodeAddresses::new(peer, None, None).unwrap();
        assert_eq!(addrs.local(), None);

        addrs.add_listen("/ip4/127.0.0.1/tcp/9474".parse().unwrap());
        addrs.add_listen("/ip4/192.168.1.4/tcp/9474".parse().unwrap());
        addrs.add_listen(format!("/ip4/10.0.0.9/tcp/1/p2p/{peer}/p2p-circuit").parse().unwrap());
        assert_eq!(addrs.local().unwrap(), format!("/ip4/192.168.1.4/tcp/9474/p2p/{peer}"));

        addrs.remove_listen(&"/ip4/192.168.1.4/tcp/9474".parse().unwrap());
        assert_eq!(addrs.local().unwrap(), format!("/ip4/127.0.0.1/tcp/9474/p2p/{peer}"));
    }

    #[test]
    fn test_configured_addresses_win() {
        let peer = PeerId::random();
        let addrs = NodeAddresses::new(
            peer,
            Some("/dns4/box.local/tcp/9474"),
            Some(&format!("/ip4/203.0.113.5/tcp/9474/p2p/{peer}")),
        )
        .unwrap();
        addrs.add_listen("/ip4/192.168.1.4/tcp/9474".parse().unwrap());
        let info = addrs.p2p_info();
        assert_eq!(info.local_multiaddr.unwrap(), format!("/dns4/box.local/tcp/9474/p2p/{peer}"));
        assert_eq!(info.public_multiaddr.unwrap(), format!("/ip4/203.0.113.5/tcp/9474/p2p/{peer}"));
        assert!(addrs.has_public());
    }

    #[test]
    fn test_bad_configured_address_rejected() {
        assert!(NodeAddresses::new(PeerId::random(), Some("not an addr"), None).is_err());
    }
}
