//! Head and control types carried inside frames.
//!
//! Request/response heads travel as typed-chunk HEAD payloads; WebSocket
//! commands and statuses travel as packet bodies on their channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header list in wire order, serialized as `[[name, value], ...]`.
pub type HeaderList = Vec<(String, String)>;

// ============================================================================
// Request tunnel
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderList,
}

impl RequestHead {
    /// GET and HEAD requests never carry a body upstream.
    pub fn allows_body(&self) -> bool {
        !matches!(self.method.to_ascii_uppercase().as_str(), "GET" | "HEAD")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub redirected: bool,
    #[serde(rename = "type", default = "default_response_type")]
    pub kind: String,
}

fn default_response_type() -> String {
    "basic".into()
}

impl ResponseHead {
    /// A synthetic response describing a failure on the serving side.
    pub fn failure(status: u16, status_text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            ok: false,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            url: url.into(),
            redirected: false,
            kind: default_response_type(),
        }
    }
}

/// Upstream call aborted by the client.
pub const STATUS_CLIENT_CLOSED: u16 = 499;
/// Upstream call timed out.
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;
/// Any other upstream failure.
pub const STATUS_INTERNAL_ERROR: u16 = 500;

// ============================================================================
// WebSocket tunnel
// ============================================================================

/// Logical sub-channel of a WebSocket tunnel; the `type` of each packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WsChannel {
    Command,
    Message,
    Status,
}

impl WsChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WsChannel::Command => "COMMAND",
            WsChannel::Message => "MESSAGE",
            WsChannel::Status => "STATUS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COMMAND" => Some(WsChannel::Command),
            "MESSAGE" => Some(WsChannel::Message),
            "STATUS" => Some(WsChannel::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WsMethod {
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsCommand {
    pub method: WsMethod,
    #[serde(default)]
    pub detail: Value,
}

impl WsCommand {
    pub fn open(url: impl Into<String>, protocols: Vec<String>) -> Self {
        let detail = WsOpen {
            url: url.into(),
            protocols,
        };
        Self {
            method: WsMethod::Open,
            detail: serde_json::to_value(detail).unwrap_or(Value::Null),
        }
    }

    pub fn close() -> Self {
        Self {
            method: WsMethod::Close,
            detail: Value::Null,
        }
    }

    pub fn open_detail(&self) -> Option<WsOpen> {
        serde_json::from_value(self.detail.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsOpen {
    pub url: String,
    #[serde(default)]
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WsState {
    Opened,
    Closed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsStatus {
    pub status: WsState,
    #[serde(default)]
    pub detail: Value,
}

impl WsStatus {
    pub fn opened() -> Self {
        Self {
            status: WsState::Opened,
            detail: Value::Null,
        }
    }

    pub fn closed(detail: CloseDetail) -> Self {
        Self {
            status: WsState::Closed,
            detail: serde_json::to_value(detail).unwrap_or(Value::Null),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: WsState::Error,
            detail: Value::String(message.into()),
        }
    }

    pub fn close_detail(&self) -> Option<CloseDetail> {
        serde_json::from_value(self.detail.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDetail {
    pub code: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub was_clean: bool,
}

impl CloseDetail {
    /// Pushed locally when the tunnel stream ends without a close from the peer.
    pub fn stream_closed() -> Self {
        Self {
            code: 1001,
            reason: "stream closed".into(),
            was_clean: true,
        }
    }
}

// ============================================================================
// Direct query
// ============================================================================

/// The home peer's own view of its reachable addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pInfo {
    #[serde(default)]
    pub local_multiaddr: Option<String>,
    #[serde(default)]
    pub public_multiaddr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub info: P2pInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_head_wire_shape() {
        let head = RequestHead {
            method: "GET".into(),
            url: "http://x.local/".into(),
            headers: vec![("accept".into(), "*/*".into())],
        };
        let v = serde_json::to_value(&head).unwrap();
        assert_eq!(v, json!({"method": "GET", "url": "http://x.local/", "headers": [["accept", "*/*"]]}));
        assert!(!head.allows_body());
    }

    #[test]
    fn test_response_head_field_names() {
        let v = serde_json::to_value(ResponseHead::failure(408, "Request Timeout", "http://a/")).unwrap();
        assert_eq!(v["statusText"], "Request Timeout");
        assert_eq!(v["type"], "basic");
        assert_eq!(v["ok"], false);
    }

    #[test]
    fn test_response_head_defaults() {
        let head: ResponseHead = serde_json::from_value(json!({"status": 204})).unwrap();
        assert_eq!(head.status, 204);
        assert!(head.headers.is_empty());
        assert_eq!(head.kind, "basic");
    }

    #[test]
    fn test_ws_command_open() {
        let cmd = WsCommand::open("ws://box.local/socket", vec!["chat".into()]);
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["method"], "OPEN");
        assert_eq!(v["detail"]["url"], "ws://box.local/socket");

        let back: WsCommand = serde_json::from_value(v).unwrap();
        assert_eq!(back.open_detail().unwrap().protocols, vec!["chat".to_string()]);
    }

    #[test]
    fn test_ws_close_command_without_detail() {
        let cmd: WsCommand = serde_json::from_value(json!({"method": "CLOSE"})).unwrap();
        assert_eq!(cmd.method, WsMethod::Close);
        assert!(cmd.open_detail().is_none());
    }

    #[test]
    fn test_ws_status_closed_detail() {
        let status = WsStatus::closed(CloseDetail::stream_closed());
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["status"], "CLOSED");
        assert_eq!(v["detail"]["code"], 1001);
        assert_eq!(v["detail"]["wasClean"], true);
        assert_eq!(status.close_detail().unwrap().reason, "stream closed");
    }

    #[test]
    fn test_channel_names() {
        for ch in [WsChannel::Command, WsChannel::Message, WsChannel::Status] {
            assert_eq!(WsChannel::parse(ch.as_str()), Some(ch));
        }
        assert_eq!(WsChannel::parse("OTHER"), None);
    }

    #[test]
    fn test_info_response_shape() {
        let v = json!({"info": {"localMultiaddr": "/ip4/10.0.0.2/tcp/9000/p2p/12D3KooWabc"}});
        let parsed: InfoResponse = serde_json::from_value(v).unwrap();
        assert!(parsed.info.local_multiaddr.is_some());
        assert!(parsed.info.public_multiaddr.is_none());
    }
}
