//! Local HTTP gateway: plain requests go through the request tunnel and
//! WebSocket upgrades are bridged onto a WebSocket tunnel.
//!
//! Works as a forward proxy (absolute-form request targets) or, for
//! origin-form targets, against the `Host` header.

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use burrow_protocol::{RequestHead, WsCommand, WsState, WsStatus};
use libp2p::futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::request_tunnel::{RequestTunnel, TunnelRequest, TunnelResponse};
use crate::ws_tunnel::{PagePorts, WsPorts, WsTunnel};

/// Close code sent when the tunnel reports an error.
const INTERNAL_ERROR_CODE: u16 = 1011;

/// Headers that describe one hop and are not forwarded.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub struct Gateway {
    requests: Arc<RequestTunnel>,
    websockets: Arc<WsTunnel>,
}

impl Gateway {
    pub fn new(requests: Arc<RequestTunnel>, websockets: Arc<WsTunnel>) -> Self {
        Self { requests, websockets }
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(proxy).with_state(gateway)
}

fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Upstream URL for a request target.
pub fn target_url(uri: &Uri, headers: &HeaderMap, websocket: bool) -> Option<String> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let (scheme, authority) = match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => (scheme.to_string(), authority.to_string()),
        _ => {
            let host = headers.get("host")?.to_str().ok()?;
            ("http".to_string(), host.to_string())
        }
    };
    let scheme = match (websocket, scheme.as_str()) {
        (true, "https") | (true, "wss") => "wss",
        (true, _) => "ws",
        (false, "ws") => "http",
        (false, "wss") => "https",
        (false, s) => s,
    };
    Some(format!("{scheme}://{authority}{path}"))
}

async fn proxy(
    State(gateway): State<Arc<Gateway>>,
    upgrade: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    let Some(url) = target_url(request.uri(), request.headers(), upgrade.is_some()) else {
        return (StatusCode::BAD_REQUEST, "request has no target host").into_response();
    };

    if let Some(upgrade) = upgrade {
        let protocols: Vec<String> = request
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        let upgrade = if protocols.is_empty() {
            upgrade
        } else {
            upgrade.protocols(protocols.clone())
        };
        let tunnel = gateway.websockets.clone();
        tracing::info!(%url, "proxy: websocket upgrade");
        return upgrade.on_upgrade(move |socket| bridge(socket, tunnel, url, protocols));
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let head = RequestHead {
        method: parts.method.to_string(),
        url: url.clone(),
        headers: parts
            .headers
            .iter()
            .filter(|(name, _)| !is_hop_header(name.as_str()))
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect(),
    };

    // Dropping this handler (client went away) cancels the tunnel request
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let requests = gateway.requests.clone();
    let task = tokio::spawn(async move { requests.send(TunnelRequest { head, body }, cancel).await });
    let result = task.await;
    guard.disarm();

    match result {
        Ok(Ok(response)) => into_response(response),
        Ok(Err(e)) => {
            tracing::warn!(%url, "proxy: tunnel request failed: {e}");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn into_response(response: TunnelResponse) -> Response {
    let Ok(status) = StatusCode::from_u16(response.head.status) else {
        return (StatusCode::BAD_GATEWAY, "invalid upstream status").into_response();
    };
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.head.headers {
        if !is_hop_header(name) {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|e| (StatusCode::BAD_GATEWAY, e.to_string()).into_response())
}

fn close_frame(code: u16, reason: String) -> Message {
    // Reserved codes must not appear on the wire
    let code = match code {
        1005 | 1006 | 1015 => INTERNAL_ERROR_CODE,
        c => c,
    };
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

fn to_socket(data: Bytes) -> Message {
    match String::from_utf8(data.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

/// Bridge a browser-facing socket and a WebSocket tunnel until either side
/// closes. Dropping the page ports ends the tunnel.
async fn bridge(socket: WebSocket, tunnel: Arc<WsTunnel>, url: String, protocols: Vec<String>) {
    let (ports, page) = WsPorts::pair();
    tokio::spawn(async move {
        if let Err(e) = tunnel.run(ports).await {
            tracing::debug!("proxy: websocket tunnel ended: {e}");
        }
    });
    let PagePorts {
        command,
        mut message,
        mut status,
    } = page;

    let open = match serde_json::to_vec(&WsCommand::open(url.clone(), protocols)) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("proxy: cannot encode open command: {e}");
            return;
        }
    };
    if command.post.send(Bytes::from(open)).await.is_err() {
        return;
    }

    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if message.post.send(Bytes::from(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if message.post.send(Bytes::from(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%url, "proxy: socket error: {e}");
                    break;
                }
            },
            outgoing = message.receive.recv() => {
                let Some(data) = outgoing else { break };
                if sink.send(to_socket(data)).await.is_err() {
                    break;
                }
            }
            update = status.receive.recv() => {
                let Some(raw) = update else { break };
                let update: WsStatus = match serde_json::from_slice(&raw) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("proxy: bad status from tunnel: {e}");
                        continue;
                    }
                };
                match update.status {
                    WsState::Opened => tracing::debug!(%url, "proxy: upstream socket open"),
                    WsState::Closed => {
                        let (code, reason) = update
                            .close_detail()
                            .map(|d| (d.code, d.reason))
                            .unwrap_or((1000, String::new()));
                        let _ = sink.send(close_frame(code, reason)).await;
                        break;
                    }
                    WsState::Error => {
                        tracing::debug!(%url, detail = %update.detail, "proxy: upstream socket error");
                        let _ = sink.send(close_frame(INTERNAL_ERROR_CODE, "upstream error".into())).await;
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(%url, "proxy: websocket bridge closed");
}
