//! WebSocket handler -- opens real WebSockets for a client tunnel and relays
//! packets both ways.

use bytes::Bytes;
use burrow_protocol::{CloseDetail, Packet, WsChannel, WsCommand, WsMethod, WsOpen, WsStatus};
use libp2p::futures::stream::{SplitSink, SplitStream};
use libp2p::futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::raw_stream::{RawStream, StreamWriter};
use crate::ws_tunnel::PacketChannel;

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type UpstreamSink = SplitSink<Upstream, Message>;
type UpstreamSource = SplitStream<Upstream>;

/// Upstream close code when the socket ended without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

struct Session {
    writer: StreamWriter,
    chunk_size: usize,
}

impl Session {
    fn send(&self, channel: WsChannel, body: Bytes) -> bool {
        match PacketChannel::write(&self.writer, channel, body, self.chunk_size) {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!("ws: cannot encode packet: {e}");
                true
            }
        }
    }

    fn status(&self, status: WsStatus) {
        tracing::debug!(status = ?status.status, "ws: status");
        match serde_json::to_vec(&status) {
            Ok(json) => {
                self.send(WsChannel::Status, json.into());
            }
            Err(e) => tracing::warn!("ws: cannot encode status: {e}"),
        }
    }
}

async fn open_upstream(open: &WsOpen) -> Result<Upstream, String> {
    let mut request = open.url.as_str().into_client_request().map_err(|e| e.to_string())?;
    if !open.protocols.is_empty() {
        let value = HeaderValue::from_str(&open.protocols.join(", ")).map_err(|e| e.to_string())?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    let (ws, _) = connect_async(request).await.map_err(|e| e.to_string())?;
    Ok(ws)
}

/// Serve one websocket tunnel stream until it closes.
pub async fn serve(stream: RawStream, chunk_size: usize) {
    let (mut reader, writer) = stream.split();
    let session = Session { writer, chunk_size };
    let mut packets = PacketChannel::new();
    let mut sink: Option<UpstreamSink> = None;
    let mut source: Option<UpstreamSource> = None;

    loop {
        tokio::select! {
            unit = reader.read() => {
                let Some(unit) = unit else { break };
                let decoded = match packets.push(&unit) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("ws: bad packet: {e}");
                        break;
                    }
                };
                for packet in decoded {
                    dispatch(&session, packet, &mut sink, &mut source).await;
                }
            }
            msg = async { source.as_mut()?.next().await }, if source.is_some() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.send(WsChannel::Message, Bytes::from(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        session.send(WsChannel::Message, Bytes::from(data));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let detail = match frame {
                            Some(f) => CloseDetail {
                                code: f.code.into(),
                                reason: f.reason.into_owned(),
                                was_clean: true,
                            },
                            None => CloseDetail { code: 1000, reason: "closed".into(), was_clean: true },
                        };
                        session.status(WsStatus::closed(detail));
                        sink = None;
                        source = None;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        session.status(WsStatus::error(e.to_string()));
                        session.status(WsStatus::closed(CloseDetail {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                            was_clean: false,
                        }));
                        sink = None;
                        source = None;
                    }
                    None => {
                        session.status(WsStatus::closed(CloseDetail {
                            code: ABNORMAL_CLOSURE,
                            reason: "upstream ended".into(),
                            was_clean: false,
                        }));
                        sink = None;
                        source = None;
                    }
                }
            }
        }
    }

    if let Some(mut sink) = sink {
        let _ = sink.send(Message::Close(None)).await;
    }
    session.writer.close();
    tracing::debug!("ws: tunnel stream closed");
}

async fn dispatch(
    session: &Session,
    packet: Packet,
    sink: &mut Option<UpstreamSink>,
    source: &mut Option<UpstreamSource>,
) {
    let Some(channel) = packet.kind().and_then(WsChannel::parse) else {
        tracing::warn!(kind = ?packet.kind(), "ws: unknown packet type");
        return;
    };
    match channel {
        WsChannel::Command => {
            let command: WsCommand = match serde_json::from_slice(&packet.body) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("ws: bad command: {e}");
                    return;
                }
            };
            match command.method {
                WsMethod::Open => {
                    let Some(open) = command.open_detail() else {
                        session.status(WsStatus::error("open without url"));
                        return;
                    };
                    if let Some(mut old) = sink.take() {
                        let _ = old.send(Message::Close(None)).await;
                    }
                    *source = None;
                    tracing::info!(url = %open.url, "ws: opening upstream");
                    match open_upstream(&open).await {
                        Ok(ws) => {
                            let (tx, rx) = ws.split();
                            *sink = Some(tx);
                            *source = Some(rx);
                            session.status(WsStatus::opened());
                        }
                        Err(e) => {
                            tracing::debug!(url = %open.url, "ws: upstream open failed: {e}");
                            session.status(WsStatus::error(e));
                        }
                    }
                }
                WsMethod::Close => {
                    if let Some(tx) = sink.as_mut() {
                        let _ = tx.send(Message::Close(None)).await;
                    }
                }
            }
        }
        WsChannel::Message => {
            let Some(tx) = sink.as_mut() else {
                tracing::debug!("ws: message before open, dropped");
                return;
            };
            if let Err(e) = tx.send(Message::Binary(packet.body.to_vec())).await {
                session.status(WsStatus::error(e.to_string()));
            }
        }
        WsChannel::Status => {
            tracing::warn!("ws: status packet from client ignored");
        }
    }
}
