//! Burrow Node -- library crate for the P2P request tunnel.
//!
//! Client side: connection manager, stream factory and pool, request and
//! WebSocket tunnels, local gateway. Server side: protocol handlers, relays,
//! heartbeat. Both share the libp2p swarm task and the raw stream wrapper.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod direct_query;
pub mod events;
pub mod gateway;
pub mod heartbeat;
pub mod identity;
pub mod link;
pub mod ping;
pub mod raw_stream;
pub mod relay_feed;
pub mod request_tunnel;
pub mod server;
pub mod stream_factory;
pub mod swarm_task;
pub mod ws_tunnel;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Parse a listen address (supports both "host:port" and Multiaddr format).
pub fn parse_listen_addr(addr: &str) -> anyhow::Result<libp2p::Multiaddr> {
    if let Ok(ma) = addr.parse::<libp2p::Multiaddr>() {
        return Ok(ma);
    }

    // host:port -> /ip4/HOST/tcp/PORT
    let socket_addr: std::net::SocketAddr = addr.parse()?;
    let proto = if socket_addr.is_ipv6() { "ip6" } else { "ip4" };
    let multiaddr: libp2p::Multiaddr =
        format!("/{proto}/{}/tcp/{}", socket_addr.ip(), socket_addr.port()).parse()?;
    Ok(multiaddr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr_forms() {
        assert_eq!(
            parse_listen_addr("/ip4/0.0.0.0/tcp/9474").unwrap().to_string(),
            "/ip4/0.0.0.0/tcp/9474"
        );
        assert_eq!(parse_listen_addr("127.0.0.1:4001").unwrap().to_string(), "/ip4/127.0.0.1/tcp/4001");
        assert_eq!(parse_listen_addr("[::1]:4001").unwrap().to_string(), "/ip6/::1/tcp/4001");
        assert!(parse_listen_addr("nonsense").is_err());
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/burrow.db"), PathBuf::from("/var/lib/burrow.db"));
    }
}
