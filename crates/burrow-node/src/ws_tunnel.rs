//! WebSocket tunnel -- relays a page's COMMAND / MESSAGE / STATUS ports over
//! one websocket stream.
//!
//! Every port message becomes one typed packet (`{type, bodyLength}` + body),
//! sliced to the chunk size. Packets read back are reassembled and routed to
//! the port named by their type. When the stream ends the page gets a
//! synthetic CLOSED status.

use bytes::{Bytes, BytesMut};
use burrow_protocol::codec::slices;
use burrow_protocol::{
    CloseDetail, Packet, PacketCodec, ProtocolError, TunnelTiming, WsChannel, WsCommand, WsStatus,
    WEBSOCKET_PROTOCOL,
};
use libp2p::StreamProtocol;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

use crate::raw_stream::{RawStream, StreamReader, StreamWriter};
use crate::request_tunnel::TunnelError;
use crate::stream_factory::{StreamKind, StreamSource};

const PORT_CAPACITY: usize = 64;

/// Tunnel side of one message channel.
pub struct Port {
    /// Messages posted by the page.
    pub from_page: mpsc::Receiver<Bytes>,
    /// Messages delivered to the page.
    pub to_page: mpsc::Sender<Bytes>,
}

/// Page side of one message channel.
pub struct PagePort {
    pub post: mpsc::Sender<Bytes>,
    pub receive: mpsc::Receiver<Bytes>,
}

fn port_pair() -> (Port, PagePort) {
    let (post, from_page) = mpsc::channel(PORT_CAPACITY);
    let (to_page, receive) = mpsc::channel(PORT_CAPACITY);
    (Port { from_page, to_page }, PagePort { post, receive })
}

/// The three ports handed over by an open request.
pub struct WsPorts {
    pub command: Port,
    pub message: Port,
    pub status: Port,
}

pub struct PagePorts {
    pub command: PagePort,
    pub message: PagePort,
    pub status: PagePort,
}

impl WsPorts {
    pub fn pair() -> (WsPorts, PagePorts) {
        let (command, page_command) = port_pair();
        let (message, page_message) = port_pair();
        let (status, page_status) = port_pair();
        (
            WsPorts { command, message, status },
            PagePorts {
                command: page_command,
                message: page_message,
                status: page_status,
            },
        )
    }

    fn senders(&self) -> PageSenders {
        PageSenders {
            command: self.command.to_page.clone(),
            message: self.message.to_page.clone(),
            status: self.status.to_page.clone(),
        }
    }
}

/// Page-bound halves of the three ports, owned by the inbound task.
struct PageSenders {
    command: mpsc::Sender<Bytes>,
    message: mpsc::Sender<Bytes>,
    status: mpsc::Sender<Bytes>,
}

impl PageSenders {
    fn get(&self, channel: WsChannel) -> &mpsc::Sender<Bytes> {
        match channel {
            WsChannel::Command => &self.command,
            WsChannel::Message => &self.message,
            WsChannel::Status => &self.status,
        }
    }
}

/// Packet framing over stream units.
#[derive(Default)]
pub struct PacketChannel {
    codec: PacketCodec,
    buf: BytesMut,
}

impl PacketChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one unit; returns every packet it completes.
    pub fn push(&mut self, unit: &[u8]) -> Result<Vec<Packet>, ProtocolError> {
        self.buf.extend_from_slice(unit);
        let mut packets = Vec::new();
        while let Some(packet) = self.codec.decode(&mut self.buf)? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Write one typed packet as slices. Returns false if the stream closed.
    pub fn write(
        writer: &StreamWriter,
        channel: WsChannel,
        body: Bytes,
        chunk_size: usize,
    ) -> Result<bool, ProtocolError> {
        let encoded = Packet::typed(channel.as_str(), body).encode()?;
        Ok(slices(encoded, chunk_size).into_iter().all(|s| writer.write(s)))
    }
}

pub struct WsTunnel {
    source: Arc<dyn StreamSource>,
    timing: TunnelTiming,
}

impl WsTunnel {
    pub fn new(source: Arc<dyn StreamSource>, timing: TunnelTiming) -> Self {
        Self { source, timing }
    }

    /// Open a stream and relay until it ends or the page drops its ports.
    pub async fn run(&self, ports: WsPorts) -> Result<(), TunnelError> {
        let protocol = StreamProtocol::new(WEBSOCKET_PROTOCOL);
        let stream = match self.source.checkout(protocol, StreamKind::WebSocket).await {
            Ok(stream) => stream,
            Err(e) => {
                push_status(&ports, WsStatus::error(e.to_string())).await;
                return Err(e.into());
            }
        };
        relay(stream, ports, self.timing.chunk_size).await
    }
}

async fn push_status(ports: &WsPorts, status: WsStatus) {
    match serde_json::to_vec(&status) {
        Ok(json) => {
            let _ = ports.status.to_page.send(Bytes::from(json)).await;
        }
        Err(e) => tracing::warn!("ws: cannot encode status: {e}"),
    }
}

/// Write one port message; `Some` ends the relay.
fn forward(
    writer: &StreamWriter,
    channel: WsChannel,
    body: Bytes,
    chunk_size: usize,
) -> Option<Result<(), TunnelError>> {
    match PacketChannel::write(writer, channel, body, chunk_size) {
        Ok(true) => None,
        Ok(false) => Some(Ok(())),
        Err(e) => Some(Err(e.into())),
    }
}

/// Route packets from the stream to the page until the stream ends. A page
/// that reads slowly only holds up this direction.
async fn deliver(mut reader: StreamReader, senders: PageSenders) -> Result<(), TunnelError> {
    let mut packets = PacketChannel::new();
    while let Some(unit) = reader.read().await {
        for packet in packets.push(&unit)? {
            let Some(channel) = packet.kind().and_then(WsChannel::parse) else {
                tracing::warn!(kind = ?packet.kind(), "ws: packet without a known channel");
                continue;
            };
            if senders.get(channel).send(packet.body).await.is_err() {
                tracing::debug!(channel = channel.as_str(), "ws: page port gone");
            }
        }
    }
    Ok(())
}

/// Relay between the page ports and an open stream.
pub async fn relay(stream: RawStream, mut ports: WsPorts, chunk_size: usize) -> Result<(), TunnelError> {
    let (reader, writer) = stream.split();
    let mut inbound = tokio::spawn(deliver(reader, ports.senders()));
    let mut message_open = true;
    let mut status_open = true;

    let outcome = loop {
        tokio::select! {
            done = &mut inbound => {
                break done.unwrap_or_else(|e| Err(TunnelError::Stream(format!("inbound task: {e}"))));
            }
            msg = ports.command.from_page.recv() => {
                let Some(body) = msg else {
                    // Page dropped its ports; ask the server to close upstream
                    if let Ok(json) = serde_json::to_vec(&WsCommand::close()) {
                        let _ = PacketChannel::write(&writer, WsChannel::Command, json.into(), chunk_size);
                    }
                    break Ok(());
                };
                if let Some(end) = forward(&writer, WsChannel::Command, body, chunk_size) {
                    break end;
                }
            }
            msg = ports.message.from_page.recv(), if message_open => match msg {
                Some(body) => {
                    if let Some(end) = forward(&writer, WsChannel::Message, body, chunk_size) {
                        break end;
                    }
                }
                None => message_open = false,
            },
            msg = ports.status.from_page.recv(), if status_open => match msg {
                Some(body) => {
                    if let Some(end) = forward(&writer, WsChannel::Status, body, chunk_size) {
                        break end;
                    }
                }
                None => status_open = false,
            },
        }
    };

    inbound.abort();
    writer.close();
    push_status(&ports, WsStatus::closed(CloseDetail::stream_closed())).await;
    tracing::debug!("ws: tunnel ended");
    outcome
}
