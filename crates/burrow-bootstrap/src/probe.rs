//! Address probing: a bounded raw transport dial, no protocol upgrade.

use libp2p::futures::future::BoxFuture;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::time::{Duration, Instant};

use crate::address::BootstrapAddress;

/// Measures reachability of an address. `None` means unreachable within
/// `timeout`.
pub trait Prober: Send + Sync {
    fn probe<'a>(
        &'a self,
        addr: &'a BootstrapAddress,
        timeout: Duration,
    ) -> BoxFuture<'a, Option<Duration>>;
}

/// Probes by opening a TCP connection to the first transport hop of the
/// address (the relay itself for relayed addresses).
#[derive(Debug, Default, Clone)]
pub struct TcpProber;

impl Prober for TcpProber {
    fn probe<'a>(
        &'a self,
        addr: &'a BootstrapAddress,
        timeout: Duration,
    ) -> BoxFuture<'a, Option<Duration>> {
        Box::pin(async move {
            let Some((host, port)) = dial_target(addr.multiaddr()) else {
                tracing::debug!(addr = %addr.multiaddr(), "registry: no tcp hop to probe");
                return None;
            };
            let started = Instant::now();
            match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), port))).await {
                Ok(Ok(_)) => Some(started.elapsed()),
                Ok(Err(e)) => {
                    tracing::debug!(addr = %addr.multiaddr(), "registry: probe failed: {e}");
                    None
                }
                Err(_) => {
                    tracing::debug!(addr = %addr.multiaddr(), ?timeout, "registry: probe timed out");
                    None
                }
            }
        })
    }
}

/// Host and TCP port of the first hop.
pub fn dial_target(addr: &Multiaddr) -> Option<(String, u16)> {
    let mut host = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) if host.is_none() => host = Some(ip.to_string()),
            Protocol::Ip6(ip) if host.is_none() => host = Some(ip.to_string()),
            Protocol::Dns(h) | Protocol::Dns4(h) | Protocol::Dns6(h) if host.is_none() => {
                host = Some(h.to_string())
            }
            Protocol::Tcp(port) => return host.map(|h| (h, port)),
            Protocol::P2pCircuit => return None,
            _ => {}
        }
    }
    None
}
