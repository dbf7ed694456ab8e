//! Configuration types for burrow-node.
//! Parsed from ~/.burrow/config.toml.

use burrow_protocol::TunnelTiming;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timing: TunnelTiming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_identity_key")]
    pub identity_key: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Base URL of the home peer's info API, e.g. `http://box.localhost:9480`.
    pub api_root: Option<String>,
    /// Hostname used to derive `/dns4/<host>/...` forms of the local address.
    pub server_host: Option<String>,
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            api_root: None,
            server_host: None,
            gateway_addr: default_gateway_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    /// Address that `localhost`/`.local` hosts resolve to for outbound calls.
    #[serde(default = "default_fetch_localhost_ip")]
    pub fetch_localhost_ip: String,
    #[serde(default = "default_overlay_suffix")]
    pub overlay_suffix: String,
    /// Overlay hostname that means "this box".
    pub overlay_alias: Option<String>,
    /// Activate discovered relays even when a public port mapping exists.
    #[serde(default)]
    pub force_relay_open: bool,
    /// Publicly reachable multiaddr, if port mapping is in place.
    pub public_addr: Option<String>,
    /// Preferred LAN multiaddr; defaults to the first listen address.
    pub local_addr: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Serve as a circuit relay for other peers.
    #[serde(default)]
    pub relay_hop: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            api_addr: default_api_addr(),
            fetch_localhost_ip: default_fetch_localhost_ip(),
            overlay_suffix: default_overlay_suffix(),
            overlay_alias: None,
            force_relay_open: false,
            public_addr: None,
            local_addr: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            relay_hop: false,
        }
    }
}

// Default value functions
fn default_identity_key() -> String {
    "~/.burrow/identity.json".into()
}
fn default_database() -> String {
    "~/.burrow/burrow.db".into()
}
fn default_listen_addrs() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/9474".into()]
}
fn default_gateway_addr() -> String {
    "127.0.0.1:9481".into()
}
fn default_api_addr() -> String {
    "0.0.0.0:9480".into()
}
fn default_fetch_localhost_ip() -> String {
    "127.0.0.1".into()
}
fn default_overlay_suffix() -> String {
    ".yg".into()
}
fn default_heartbeat_interval_ms() -> u64 {
    burrow_protocol::DEFAULT_TIMING.heartbeat_interval_ms
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                identity_key: default_identity_key(),
                database: default_database(),
                listen_addrs: default_listen_addrs(),
            },
            client: ClientSection::default(),
            server: ServerSection::default(),
            timing: TunnelTiming::default(),
        }
    }
}
