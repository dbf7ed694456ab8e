//! Request handler -- performs tunneled HTTP requests on behalf of the client.
//!
//! One stream carries any number of sequential requests. Each response is
//! streamed back as HEAD / BODY... / END. A client ABORT stops the outbound
//! call; upstream failures turn into synthetic 408 / 500 responses.

use bytes::{Bytes, BytesMut};
use burrow_protocol::chunk::{body_chunks, encode_head, head_chunks};
use burrow_protocol::{
    Chunk, Frame, FrameReader, ProtocolError, RequestHead, ResponseHead, STATUS_CLIENT_CLOSED,
    STATUS_INTERNAL_ERROR, STATUS_REQUEST_TIMEOUT,
};
use libp2p::futures::future::BoxFuture;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::raw_stream::{RawStream, StreamReader, StreamWriter};

/// Resolves hostnames of the alternate overlay network.
pub trait OverlayDns: Send + Sync {
    fn resolve(&self, host: &str) -> BoxFuture<'_, Option<IpAddr>>;
}

/// Fixed overlay host table.
#[derive(Debug, Default, Clone)]
pub struct StaticOverlay {
    hosts: HashMap<String, IpAddr>,
}

impl StaticOverlay {
    pub fn new(hosts: HashMap<String, IpAddr>) -> Self {
        Self { hosts }
    }
}

impl OverlayDns for StaticOverlay {
    fn resolve(&self, host: &str) -> BoxFuture<'_, Option<IpAddr>> {
        let ip = self.hosts.get(host).copied();
        Box::pin(async move { ip })
    }
}

/// Where a hostname is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Localhost,
    Overlay,
    System,
}

/// DNS override for outbound calls.
pub struct OverrideResolver {
    localhost: IpAddr,
    overlay_suffix: String,
    overlay_alias: Option<String>,
    overlay: Arc<dyn OverlayDns>,
}

impl OverrideResolver {
    pub fn new(
        localhost: IpAddr,
        overlay_suffix: impl Into<String>,
        overlay_alias: Option<String>,
        overlay: Arc<dyn OverlayDns>,
    ) -> Self {
        Self {
            localhost,
            overlay_suffix: overlay_suffix.into(),
            overlay_alias,
            overlay,
        }
    }

    pub fn route(&self, host: &str) -> Route {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.ends_with("localhost") || host.ends_with(".local") {
            return Route::Localhost;
        }
        if !self.overlay_suffix.is_empty() && host.ends_with(&self.overlay_suffix.to_ascii_lowercase()) {
            if self.overlay_alias.as_deref().map(str::to_ascii_lowercase) == Some(host) {
                return Route::Localhost;
            }
            return Route::Overlay;
        }
        Route::System
    }
}

impl Resolve for OverrideResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let route = self.route(&host);
        let localhost = self.localhost;
        let overlay = self.overlay.clone();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = match route {
                Route::Localhost => vec![SocketAddr::new(localhost, 0)],
                Route::Overlay => match overlay.resolve(&host).await {
                    Some(ip) => vec![SocketAddr::new(ip, 0)],
                    None => {
                        return Err(format!("overlay host {host} not found").into());
                    }
                },
                Route::System => tokio::net::lookup_host((host.as_str(), 0)).await?.collect(),
            };
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

/// Outbound HTTP side of the request handler.
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    chunk_size: usize,
}

impl Fetcher {
    pub fn new(resolver: OverrideResolver, timeout: Duration, chunk_size: usize) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .dns_resolver(Arc::new(resolver))
            .build()?;
        Ok(Self {
            client,
            timeout,
            chunk_size,
        })
    }

    fn build(&self, head: &RequestHead, body: Bytes) -> Result<reqwest::RequestBuilder, String> {
        let method = reqwest::Method::from_bytes(head.method.as_bytes()).map_err(|e| e.to_string())?;
        let mut req = self.client.request(method, head.url.as_str());
        for (name, value) in &head.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            req = req.header(name.as_str(), value.as_str());
        }
        if head.allows_body() && !body.is_empty() {
            req = req.body(body);
        }
        Ok(req)
    }
}

/// Why a request ended early.
enum Interrupt {
    /// Client sent ABORT.
    Aborted,
    /// Stream went away.
    Gone,
}

/// Serve sequential requests on one stream until it closes.
pub async fn serve(stream: RawStream, fetcher: Arc<Fetcher>) {
    let (mut reader, writer) = stream.split();
    loop {
        let (head, body) = match read_request(&mut reader).await {
            Ok(Some(r)) => r,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("request: bad request framing: {e}");
                break;
            }
        };
        let url = head.url.clone();
        tracing::debug!(method = %head.method, %url, "request: fetching");
        match handle(&mut reader, &writer, &fetcher, head, body).await {
            Ok(()) => {}
            Err(Interrupt::Aborted) => {
                tracing::debug!(%url, "request: aborted by client");
                let failure = ResponseHead::failure(STATUS_CLIENT_CLOSED, "Client Closed Request", url);
                let _ = write_response(&writer, &failure, Bytes::new(), fetcher.chunk_size);
            }
            Err(Interrupt::Gone) => break,
        }
    }
    writer.close();
}

/// Next complete request, `None` when the stream ends first. A request the
/// client aborted mid-upload is skipped.
async fn read_request(reader: &mut StreamReader) -> Result<Option<(RequestHead, Bytes)>, ProtocolError> {
    let mut frames = FrameReader::<RequestHead>::new();
    let mut head = None;
    let mut body = BytesMut::new();
    loop {
        let Some(unit) = reader.read().await else {
            return Ok(None);
        };
        match frames.push(Chunk::parse(unit)?)? {
            None => {}
            Some(Frame::Head(h)) => head = Some(h),
            Some(Frame::Body(b)) => body.extend_from_slice(&b),
            Some(Frame::End) => {
                let head = head.ok_or(ProtocolError::UnexpectedChunk("end before head"))?;
                return Ok(Some((head, body.freeze())));
            }
            Some(Frame::Abort) => {
                head = None;
                body.clear();
            }
        }
    }
}

/// Wait for the client to interrupt the current response.
async fn interrupted(reader: &mut StreamReader) -> Interrupt {
    loop {
        match reader.read().await {
            None => return Interrupt::Gone,
            Some(unit) => match Chunk::parse(unit) {
                Ok(Chunk::Abort) => return Interrupt::Aborted,
                _ => tracing::debug!("request: ignoring unit during response"),
            },
        }
    }
}

async fn handle(
    reader: &mut StreamReader,
    writer: &StreamWriter,
    fetcher: &Fetcher,
    head: RequestHead,
    body: Bytes,
) -> Result<(), Interrupt> {
    let url = head.url.clone();
    let req = match fetcher.build(&head, body) {
        Ok(req) => req,
        Err(e) => {
            send_failure(writer, STATUS_INTERNAL_ERROR, &e, &url, fetcher.chunk_size);
            return Ok(());
        }
    };

    let sent = tokio::select! {
        r = tokio::time::timeout(fetcher.timeout, req.send()) => r,
        why = interrupted(reader) => return Err(why),
    };
    let mut response = match sent {
        Ok(Ok(response)) => response,
        Ok(Err(e)) if e.is_timeout() => {
            send_failure(writer, STATUS_REQUEST_TIMEOUT, &e.to_string(), &url, fetcher.chunk_size);
            return Ok(());
        }
        Ok(Err(e)) => {
            tracing::debug!(%url, "request: upstream failed: {e}");
            send_failure(writer, STATUS_INTERNAL_ERROR, &e.to_string(), &url, fetcher.chunk_size);
            return Ok(());
        }
        Err(_) => {
            send_failure(writer, STATUS_REQUEST_TIMEOUT, "upstream timed out", &url, fetcher.chunk_size);
            return Ok(());
        }
    };

    let head = response_head(&response, &url);
    let Ok(encoded) = encode_head(&head) else {
        send_failure(writer, STATUS_INTERNAL_ERROR, "response head too large", &url, fetcher.chunk_size);
        return Ok(());
    };
    for chunk in head_chunks(encoded, fetcher.chunk_size) {
        writer.write(chunk.to_bytes());
    }

    loop {
        let next = tokio::select! {
            c = response.chunk() => c,
            why = interrupted(reader) => return Err(why),
        };
        match next {
            Ok(Some(bytes)) => {
                for chunk in body_chunks(bytes, fetcher.chunk_size) {
                    if !writer.write(chunk.to_bytes()) {
                        return Err(Interrupt::Gone);
                    }
                }
            }
            Ok(None) => {
                writer.write(Chunk::End.to_bytes());
                return Ok(());
            }
            Err(e) => {
                // Head already sent: the client treats ABORT as final
                tracing::debug!(%url, "request: upstream body failed: {e}");
                writer.write(Chunk::Abort.to_bytes());
                return Ok(());
            }
        }
    }
}

fn response_head(response: &reqwest::Response, requested: &str) -> ResponseHead {
    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    let url = response.url().to_string();
    ResponseHead {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        ok: status.is_success(),
        headers,
        redirected: url.trim_end_matches('/') != requested.trim_end_matches('/'),
        url,
        kind: "basic".into(),
    }
}

fn send_failure(writer: &StreamWriter, status: u16, message: &str, url: &str, chunk_size: usize) {
    let head = ResponseHead::failure(status, message, url);
    if let Err(e) = write_response(writer, &head, Bytes::from(message.to_string()), chunk_size) {
        tracing::warn!("request: cannot encode failure: {e}");
    }
}

fn write_response(
    writer: &StreamWriter,
    head: &ResponseHead,
    body: Bytes,
    chunk_size: usize,
) -> Result<(), ProtocolError> {
    for chunk in burrow_protocol::chunk::frame_message(head, body, chunk_size)? {
        writer.write(chunk.to_bytes());
    }
    Ok(())
}
