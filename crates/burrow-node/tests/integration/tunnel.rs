//! End-to-end tunnel tests: client swarm -> server swarm -> local upstream.

use std::time::Duration;

use bytes::Bytes;
use burrow_node::events::ClientEvent;
use burrow_node::link::PeerLink;
use burrow_node::request_tunnel::TunnelRequest;
use burrow_node::ws_tunnel::WsPorts;
use burrow_protocol::{RequestHead, WsCommand, WsState, WsStatus};
use libp2p::multiaddr::Protocol;
use tokio_util::sync::CancellationToken;

use crate::harness::{spawn_upstream, TestClient, TestServer};

fn request(method: &str, url: String, body: Bytes) -> TunnelRequest {
    TunnelRequest {
        head: RequestHead {
            method: method.into(),
            url,
            headers: vec![("accept".into(), "*/*".into())],
        },
        body,
    }
}

/// Direct query seeds the registry and the client reaches CONNECTED.
#[tokio::test]
async fn test_client_connects_via_direct_query() {
    let server = TestServer::start().await.unwrap();
    let client = TestClient::connect(&server).await.unwrap();
    client.wait_connected(Duration::from_secs(20)).await.unwrap();

    let registry = client.client.connection().registry();
    assert_eq!(registry.server_id().await, Some(server.peer_id));

    let rtt = client.handle.ping(server.peer_id).await.unwrap();
    assert!(rtt < Duration::from_secs(5));

    client.shutdown().await;
    server.shutdown().await;
}

/// GET and POST through the request tunnel, the POST body spanning many chunks.
#[tokio::test]
async fn test_request_round_trip() {
    let upstream = spawn_upstream().await.unwrap();
    let server = TestServer::start().await.unwrap();
    let client = TestClient::connect(&server).await.unwrap();
    client.wait_connected(Duration::from_secs(20)).await.unwrap();
    let tunnel = client.client.requests();

    let response = tunnel
        .send(request("GET", format!("http://{upstream}/hello"), Bytes::new()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.head.status, 200);
    assert!(response.head.ok);
    assert_eq!(&response.body[..], b"hello from upstream");

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let response = tunnel
        .send(
            request("POST", format!("http://{upstream}/echo"), Bytes::from(payload.clone())),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.head.status, 200);
    assert_eq!(response.body.len(), payload.len());
    assert_eq!(&response.body[..], &payload[..]);

    client.shutdown().await;
    server.shutdown().await;
}

/// Upstream error statuses are delivered as responses, and an unreachable
/// upstream becomes a synthetic 500.
#[tokio::test]
async fn test_error_statuses_are_definitive() {
    let upstream = spawn_upstream().await.unwrap();
    let server = TestServer::start().await.unwrap();
    let client = TestClient::connect(&server).await.unwrap();
    client.wait_connected(Duration::from_secs(20)).await.unwrap();
    let tunnel = client.client.requests();

    let response = tunnel
        .send(request("GET", format!("http://{upstream}/teapot"), Bytes::new()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.head.status, 418);
    assert!(!response.head.ok);
    assert_eq!(&response.body[..], b"short and stout");

    let response = tunnel
        .send(request("GET", "http://127.0.0.1:1/".into(), Bytes::new()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.head.status, 500);
    assert!(!response.body.is_empty());

    client.shutdown().await;
    server.shutdown().await;
}

/// OPEN, echo and CLOSE through the WebSocket tunnel.
#[tokio::test]
async fn test_websocket_tunnel_echo() {
    let upstream = spawn_upstream().await.unwrap();
    let server = TestServer::start().await.unwrap();
    let client = TestClient::connect(&server).await.unwrap();
    client.wait_connected(Duration::from_secs(20)).await.unwrap();

    let (ports, mut page) = WsPorts::pair();
    let tunnel = client.client.websockets();
    tokio::spawn(async move { tunnel.run(ports).await });

    let open = serde_json::to_vec(&WsCommand::open(format!("ws://{upstream}/ws"), vec![])).unwrap();
    page.command.post.send(Bytes::from(open)).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), page.status.receive.recv())
        .await
        .unwrap()
        .unwrap();
    let status: WsStatus = serde_json::from_slice(&status).unwrap();
    assert_eq!(status.status, WsState::Opened);

    page.message.post.send(Bytes::from_static(b"ping over burrow")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(10), page.message.receive.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..], b"ping over burrow");

    let close = serde_json::to_vec(&WsCommand::close()).unwrap();
    page.command.post.send(Bytes::from(close)).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), page.status.receive.recv())
        .await
        .unwrap()
        .unwrap();
    let status: WsStatus = serde_json::from_slice(&status).unwrap();
    assert_eq!(status.status, WsState::Closed);

    client.shutdown().await;
    server.shutdown().await;
}

/// An activated relay reaches a connected client through the relay stream.
#[tokio::test]
async fn test_relay_activation_is_announced() {
    let relay = TestServer::start_with(true).await.unwrap();
    let server = TestServer::start().await.unwrap();
    let client = TestClient::connect(&server).await.unwrap();
    client.wait_connected(Duration::from_secs(20)).await.unwrap();
    let mut events = client.client.subscribe();

    let relay_addr = relay.listen_addr.clone().with(Protocol::P2p(relay.peer_id));
    assert!(server.relays.add_relay(relay_addr));

    let loaded = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Ok(ClientEvent::RelaysLoaded { count }) = events.recv().await {
                return count;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(loaded, 1);
    assert_eq!(server.relays.active_relays().len(), 1);

    let ranked = client.client.connection().registry().ranked_multiaddrs().await;
    assert!(ranked.iter().any(|a| a.iter().any(|p| matches!(p, Protocol::P2pCircuit))));

    client.shutdown().await;
    server.shutdown().await;
    relay.shutdown().await;
}
