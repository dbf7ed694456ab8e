//! A candidate path to the home peer.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::Duration;

use crate::AddressError;

/// Observed latency of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    /// Never probed.
    Unmeasured,
    Reachable(Duration),
    Unreachable,
}

impl Latency {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Latency::Reachable(_))
    }

    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Latency::Reachable(d) => Some(d.as_millis() as u64),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Latency::Unmeasured => "unmeasured",
            Latency::Reachable(_) => "reachable",
            Latency::Unreachable => "unreachable",
        }
    }
}

/// Persisted form: `{address, lastSeen, latency}` with `latency: null` for
/// unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub address: String,
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub latency: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapAddress {
    multiaddr: Multiaddr,
    server_id: PeerId,
    /// Unix millis of the last successful probe; 0 if never.
    pub last_seen: i64,
    pub latency: Latency,
}

impl BootstrapAddress {
    /// Parse a candidate string. It must be a multiaddr ending in `/p2p/<peer id>`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let multiaddr: Multiaddr = input
            .trim()
            .parse()
            .map_err(|e| AddressError::Malformed(format!("{input}: {e}")))?;
        Self::from_multiaddr(multiaddr)
    }

    pub fn from_multiaddr(multiaddr: Multiaddr) -> Result<Self, AddressError> {
        let server_id = match multiaddr.iter().last() {
            Some(Protocol::P2p(peer)) => peer,
            _ => return Err(AddressError::MissingPeerId(multiaddr.to_string())),
        };
        Ok(Self {
            multiaddr,
            server_id,
            last_seen: 0,
            latency: Latency::Unmeasured,
        })
    }

    pub fn from_record(record: &AddressRecord) -> Result<Self, AddressError> {
        let mut addr = Self::parse(&record.address)?;
        addr.last_seen = record.last_seen;
        addr.latency = match record.latency {
            Some(ms) => Latency::Reachable(Duration::from_millis(ms)),
            None => Latency::Unreachable,
        };
        Ok(addr)
    }

    pub fn record(&self) -> AddressRecord {
        AddressRecord {
            address: self.key(),
            last_seen: self.last_seen,
            latency: self.latency.as_millis(),
        }
    }

    pub fn multiaddr(&self) -> &Multiaddr {
        &self.multiaddr
    }

    pub fn server_id(&self) -> PeerId {
        self.server_id
    }

    /// Registry key: the string form of the multiaddr.
    pub fn key(&self) -> String {
        self.multiaddr.to_string()
    }

    /// Reached through a relay hop.
    pub fn is_relay(&self) -> bool {
        self.multiaddr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    /// Uses a hostname form rather than an IP.
    pub fn is_dns(&self) -> bool {
        self.multiaddr.iter().any(|p| {
            matches!(
                p,
                Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) | Protocol::Dnsaddr(_)
            )
        })
    }

    /// Rewrite the trailing peer id, leaving any relay peer id untouched.
    pub fn set_server_id(&mut self, id: PeerId) {
        if id == self.server_id {
            return;
        }
        let mut parts: Vec<Protocol<'static>> = self.multiaddr.iter().map(|p| p.acquire()).collect();
        if let Some(last) = parts.last_mut() {
            *last = Protocol::P2p(id);
        }
        self.multiaddr = parts.into_iter().collect();
        self.server_id = id;
    }

    /// The same path addressed through `host`: the leading IP or DNS component
    /// is replaced by `/dns4/<host>`.
    pub fn with_dns_host(&self, host: &str) -> Option<Multiaddr> {
        let mut replaced = false;
        let out: Multiaddr = self
            .multiaddr
            .iter()
            .map(|p| match p {
                Protocol::Ip4(_)
                | Protocol::Ip6(_)
                | Protocol::Dns(_)
                | Protocol::Dns4(_)
                | Protocol::Dns6(_)
                    if !replaced =>
                {
                    replaced = true;
                    Protocol::Dns4(Cow::Owned(host.to_string()))
                }
                other => other,
            })
            .collect();
        replaced.then_some(out)
    }

    /// Record a probe result taken at `now_ms`.
    pub fn observe(&mut self, latency: Option<Duration>, now_ms: i64) {
        match latency {
            Some(d) => {
                self.latency = Latency::Reachable(d);
                self.last_seen = now_ms;
            }
            None => self.latency = Latency::Unreachable,
        }
    }

    /// Seen successfully within `window` of `now_ms`.
    pub fn is_recent(&self, now_ms: i64, window: Duration) -> bool {
        self.last_seen > 0 && now_ms.saturating_sub(self.last_seen) <= window.as_millis() as i64
    }

    fn rank_key(&self) -> (u8, bool, Duration) {
        match self.latency {
            Latency::Reachable(d) => (0, self.is_relay(), d),
            Latency::Unreachable => (1, self.is_relay(), Duration::ZERO),
            Latency::Unmeasured => (2, self.is_relay(), Duration::ZERO),
        }
    }
}

/// Dial preference order.
///
/// Missing addresses sort last, then unmeasured after measured, reachable
/// before unreachable, direct before relayed, and finally ascending latency.
/// The string form breaks remaining ties so the order is total.
pub fn compare(a: Option<&BootstrapAddress>, b: Option<&BootstrapAddress>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a
            .rank_key()
            .cmp(&b.rank_key())
            .then_with(|| a.multiaddr.to_vec().cmp(&b.multiaddr.to_vec())),
    }
}
