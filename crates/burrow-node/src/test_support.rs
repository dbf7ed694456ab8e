//! In-memory fakes shared by unit tests.

use burrow_bootstrap::{AddOptions, BootstrapAddress, Prober, Registry};
use burrow_protocol::DEFAULT_TIMING;
use burrow_storage::MemoryStorage;
use libp2p::futures::future::BoxFuture;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::sync::Arc;
use std::time::Duration;

use crate::link::{CircuitListener, PeerLink, TransportError};
use crate::raw_stream::RawStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Scriptable link. Streams opened through it are handed, server side, to
/// whoever holds the receiver from [`FakeLink::serve`].
pub struct FakeLink {
    pub local: PeerId,
    pub dial_ok: AtomicBool,
    pub ping_ok: AtomicBool,
    pub open_ok: AtomicBool,
    pub dials: AtomicUsize,
    pub pings: AtomicUsize,
    pub opens: AtomicUsize,
    pub resets: AtomicUsize,
    pub seeded: Mutex<Vec<Multiaddr>>,
    pub circuits: Mutex<Vec<Multiaddr>>,
    handlers: Mutex<HashMap<StreamProtocol, mpsc::UnboundedSender<RawStream>>>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self {
            local: PeerId::random(),
            dial_ok: AtomicBool::new(true),
            ping_ok: AtomicBool::new(true),
            open_ok: AtomicBool::new(true),
            dials: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            seeded: Mutex::new(Vec::new()),
            circuits: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Receive the server side of every stream opened on `protocol`.
    pub fn serve(&self, protocol: StreamProtocol) -> mpsc::UnboundedReceiver<RawStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handlers.lock().unwrap().insert(protocol, tx);
        rx
    }
}

impl PeerLink for FakeLink {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn dial(&self, _peer: PeerId, _addrs: Vec<Multiaddr>) -> BoxFuture<'_, Result<(), TransportError>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let ok = self.dial_ok.load(Ordering::SeqCst);
        Box::pin(async move {
            if ok {
                Ok(())
            } else {
                Err(TransportError::Dial("refused".into()))
            }
        })
    }

    fn hang_up(&self, _peer: PeerId) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn add_addresses(&self, _peer: PeerId, addrs: Vec<Multiaddr>) -> BoxFuture<'_, ()> {
        self.seeded.lock().unwrap().extend(addrs);
        Box::pin(async {})
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }

    fn ping(&self, _peer: PeerId) -> BoxFuture<'_, Result<Duration, TransportError>> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let ok = self.ping_ok.load(Ordering::SeqCst);
        Box::pin(async move {
            if ok {
                Ok(Duration::from_millis(5))
            } else {
                Err(TransportError::Ping("no answer".into()))
            }
        })
    }

    fn open_stream(
        &self,
        _peer: PeerId,
        protocol: StreamProtocol,
    ) -> BoxFuture<'_, Result<RawStream, TransportError>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_ok.load(Ordering::SeqCst) {
            // Never resolves; callers bound it with a timeout
            return Box::pin(std::future::pending());
        }
        let handler = self.handlers.lock().unwrap().get(&protocol).cloned();
        Box::pin(async move {
            let (client, server) = RawStream::pair(protocol);
            match handler {
                Some(tx) if tx.send(server).is_ok() => Ok(client),
                _ => Err(TransportError::OpenStream("protocol not supported".into())),
            }
        })
    }
}

impl CircuitListener for FakeLink {
    fn listen_on_relay(&self, relay: Multiaddr) -> BoxFuture<'_, Result<(), TransportError>> {
        self.circuits.lock().unwrap().push(relay);
        Box::pin(async { Ok(()) })
    }
}

/// Every address answers in 10ms.
pub struct UpProber;

impl Prober for UpProber {
    fn probe<'a>(&'a self, _addr: &'a BootstrapAddress, _timeout: Duration) -> BoxFuture<'a, Option<Duration>> {
        Box::pin(async { Some(Duration::from_millis(10)) })
    }
}

/// Answers in 10ms while `up`, counting every probe.
pub struct SwitchProber {
    pub up: AtomicBool,
    pub probes: AtomicUsize,
}

impl SwitchProber {
    pub fn new() -> Self {
        Self {
            up: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        }
    }
}

impl Prober for SwitchProber {
    fn probe<'a>(&'a self, _addr: &'a BootstrapAddress, _timeout: Duration) -> BoxFuture<'a, Option<Duration>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let up = self.up.load(Ordering::SeqCst);
        Box::pin(async move { up.then(|| Duration::from_millis(10)) })
    }
}

/// Registry holding one direct address of a fresh server peer.
pub async fn registry_with_server() -> (Arc<Registry>, PeerId) {
    let registry = Arc::new(Registry::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(UpProber),
        DEFAULT_TIMING,
    ));
    let server = PeerId::random();
    registry
        .add_address(&format!("/ip4/10.0.0.2/tcp/9000/p2p/{server}"), AddOptions::default())
        .await
        .unwrap();
    (registry, server)
}
