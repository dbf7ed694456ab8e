//! The transport seam: what the client needs from the P2P node.
//!
//! [`crate::swarm_task::SwarmHandle`] implements it over libp2p; tests use
//! in-memory fakes.

use libp2p::futures::future::BoxFuture;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::time::Duration;

use crate::raw_stream::RawStream;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("swarm task is gone")]
    ChannelClosed,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("stream open failed: {0}")]
    OpenStream(String),
    #[error("ping failed: {0}")]
    Ping(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no server peer id known")]
    NoServer,
}

pub trait PeerLink: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Connect to `peer`, trying `addrs` plus any already known for it.
    /// Resolves immediately if a connection exists.
    fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> BoxFuture<'_, Result<(), TransportError>>;

    fn hang_up(&self, peer: PeerId) -> BoxFuture<'_, ()>;

    /// Seed the dialer's address book.
    fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> BoxFuture<'_, ()>;

    /// Drop every connection and pending dial.
    fn reset(&self) -> BoxFuture<'_, ()>;

    /// Round trip of one liveness ping.
    fn ping(&self, peer: PeerId) -> BoxFuture<'_, Result<Duration, TransportError>>;

    fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> BoxFuture<'_, Result<RawStream, TransportError>>;
}

/// Reserves circuit listen addresses through relays.
pub trait CircuitListener: Send + Sync {
    /// `relay` is a full multiaddr ending in `/p2p/<relay>`.
    fn listen_on_relay(&self, relay: Multiaddr) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Run `fut` with a deadline, mapping expiry to [`TransportError::Timeout`].
pub async fn bounded<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}
