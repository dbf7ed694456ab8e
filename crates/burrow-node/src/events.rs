//! Client-side status, events and control messages.

use libp2p::PeerId;
use serde::Serialize;

use crate::ws_tunnel::WsPorts;

/// Connectivity of the client session. `Connected` implies a live connection
/// to the server peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Offline,
    Bootstrapped,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Offline => "OFFLINE",
            ConnectionStatus::Bootstrapped => "BOOTSTRAPPED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published to every subscriber; delivery is best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Status(ConnectionStatus),
    Connected(PeerId),
    Disconnected,
    RelaysLoaded { count: usize },
    AddressCount(usize),
    HeartbeatLost,
    HeartbeatEcho,
    RollbackRequested,
}

/// Requests from the hosting surface into the client.
pub enum ControlMessage {
    /// Drop the current connection and dial again.
    RefreshConnection,
    OpenWebSocket(WsPorts),
    HeartbeatEcho,
    Rollback,
    /// Re-publish the current status and address count.
    RequestStatus,
}

impl std::fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlMessage::RefreshConnection => "RefreshConnection",
            ControlMessage::OpenWebSocket(_) => "OpenWebSocket",
            ControlMessage::HeartbeatEcho => "HeartbeatEcho",
            ControlMessage::Rollback => "Rollback",
            ControlMessage::RequestStatus => "RequestStatus",
        };
        f.write_str(name)
    }
}
