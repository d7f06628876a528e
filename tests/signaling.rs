//! Integration tests for the signaling relay: real sockets on
//! localhost, real WebSocket handshakes.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lanmesh::ports::allocate_port;
use lanmesh::SignalingServer;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "0123456789abcdef0123456789abcdef";

async fn start_server(range_start: u16) -> (SignalingServer, u16) {
    let port = allocate_port(range_start, range_start + 50).await.unwrap();
    let server = SignalingServer::start(port, SECRET).await.unwrap();
    (server, port)
}

async fn connect(port: u16, token: &str) -> WsClient {
    let url = format!("ws://127.0.0.1:{port}/?token={token}");
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Next text frame, parsed as JSON. Panics after five seconds.
async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("connection ended")
            .expect("connection error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Connect and consume the welcome, returning the assigned client id.
async fn connect_and_welcome(port: u16) -> (WsClient, String) {
    let mut ws = connect(port, SECRET).await;
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    let id = welcome["clientId"].as_str().unwrap().to_string();
    (ws, id)
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn wrong_token_is_refused_and_never_registered() {
    let (server, port) = start_server(18000).await;

    let url = format!("ws://127.0.0.1:{port}/?token=wrong");
    let result = connect_async(url).await;
    assert!(result.is_err(), "handshake with bad token must fail");

    let url = format!("ws://127.0.0.1:{port}/");
    assert!(connect_async(url).await.is_err(), "missing token must fail");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.client_ids().is_empty());
    assert_eq!(server.peer_count(), 0);
}

#[tokio::test]
async fn correct_token_gets_one_welcome_with_unique_id() {
    let (server, port) = start_server(18100).await;

    let (_ws_a, id_a) = connect_and_welcome(port).await;
    let (_ws_b, id_b) = connect_and_welcome(port).await;

    assert_ne!(id_a, id_b);
    assert_eq!(server.peer_count(), 2);
    let ids = server.client_ids();
    assert!(ids.contains(&id_a) && ids.contains(&id_b));
}

#[tokio::test]
async fn existing_clients_learn_of_new_peers() {
    let (_server, port) = start_server(18200).await;

    let (mut ws_a, _id_a) = connect_and_welcome(port).await;
    let (_ws_b, id_b) = connect_and_welcome(port).await;

    let joined = next_json(&mut ws_a).await;
    assert_eq!(joined["type"], "peer-joined");
    assert_eq!(joined["clientId"], json!(id_b));
}

#[tokio::test]
async fn targeted_message_reaches_only_its_target_with_true_sender() {
    let (_server, port) = start_server(18300).await;

    let (mut ws_a, id_a) = connect_and_welcome(port).await;
    let (mut ws_b, id_b) = connect_and_welcome(port).await;
    let (mut ws_c, _id_c) = connect_and_welcome(port).await;

    // Drain the join notifications already queued.
    next_json(&mut ws_a).await; // B joined
    next_json(&mut ws_a).await; // C joined
    next_json(&mut ws_b).await; // C joined

    // A tries to spoof its identity; the relay must overwrite `from`.
    send_json(
        &mut ws_a,
        json!({"type": "offer", "to": id_b, "from": "someone-else", "sdp": "v=0"}),
    )
    .await;

    let received = next_json(&mut ws_b).await;
    assert_eq!(received["type"], "offer");
    assert_eq!(received["from"], json!(id_a));
    assert_eq!(received["sdp"], "v=0");

    // C must see nothing.
    let nothing = timeout(Duration::from_millis(300), ws_c.next()).await;
    assert!(nothing.is_err(), "bystander received a targeted message");
}

#[tokio::test]
async fn broadcast_reaches_everyone_except_the_sender() {
    let (_server, port) = start_server(18400).await;

    let (mut ws_a, id_a) = connect_and_welcome(port).await;
    let (mut ws_b, _id_b) = connect_and_welcome(port).await;
    let (mut ws_c, _id_c) = connect_and_welcome(port).await;

    next_json(&mut ws_a).await;
    next_json(&mut ws_a).await;
    next_json(&mut ws_b).await;

    send_json(&mut ws_a, json!({"type": "announce", "payload": 7})).await;

    for ws in [&mut ws_b, &mut ws_c] {
        let received = next_json(ws).await;
        assert_eq!(received["type"], "announce");
        assert_eq!(received["from"], json!(id_a));
        assert_eq!(received["payload"], json!(7));
    }

    let nothing = timeout(Duration::from_millis(300), ws_a.next()).await;
    assert!(nothing.is_err(), "sender received its own broadcast");
}

#[tokio::test]
async fn malformed_messages_are_dropped_and_the_connection_survives() {
    let (_server, port) = start_server(18500).await;

    let (mut ws_a, id_a) = connect_and_welcome(port).await;
    let (mut ws_b, _id_b) = connect_and_welcome(port).await;
    next_json(&mut ws_a).await; // B joined

    ws_a.send(Message::Text("{not json".into())).await.unwrap();
    ws_a.send(Message::Text(r#"{"to":"x"}"#.into())).await.unwrap();

    // The connection is still usable afterwards.
    send_json(&mut ws_a, json!({"type": "still-here"})).await;
    let received = next_json(&mut ws_b).await;
    assert_eq!(received["type"], "still-here");
    assert_eq!(received["from"], json!(id_a));
}

#[tokio::test]
async fn unknown_target_is_dropped_silently() {
    let (_server, port) = start_server(18600).await;

    let (mut ws_a, _id_a) = connect_and_welcome(port).await;
    send_json(
        &mut ws_a,
        json!({"type": "offer", "to": "client-nobody", "sdp": "v=0"}),
    )
    .await;

    // Nothing comes back, and the connection stays open.
    let nothing = timeout(Duration::from_millis(300), ws_a.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn disconnect_broadcasts_exactly_one_peer_left() {
    let (server, port) = start_server(18700).await;

    let (mut ws_a, id_a) = connect_and_welcome(port).await;
    let (mut ws_b, _id_b) = connect_and_welcome(port).await;
    next_json(&mut ws_a).await; // B joined

    ws_a.close(None).await.unwrap();

    let left = next_json(&mut ws_b).await;
    assert_eq!(left["type"], "peer-left");
    assert_eq!(left["clientId"], json!(id_a));

    // No duplicate notification.
    let nothing = timeout(Duration::from_millis(300), ws_b.next()).await;
    assert!(nothing.is_err());

    assert_eq!(server.peer_count(), 1);
    assert!(!server.client_ids().contains(&id_a));
}

#[tokio::test]
async fn shutdown_broadcast_reaches_all_clients_without_closing_them() {
    let (server, port) = start_server(18800).await;

    let (mut ws_a, _) = connect_and_welcome(port).await;
    let (mut ws_b, _) = connect_and_welcome(port).await;
    next_json(&mut ws_a).await; // B joined

    server.broadcast_shutdown();

    for ws in [&mut ws_a, &mut ws_b] {
        let msg = next_json(ws).await;
        assert_eq!(msg["type"], "server-shutdown");
    }

    // Connections are still registered until stop().
    assert_eq!(server.peer_count(), 2);
}

#[tokio::test]
async fn stop_closes_clients_and_is_idempotent() {
    let (server, port) = start_server(18900).await;

    let (mut ws_a, _) = connect_and_welcome(port).await;

    server.stop();
    server.stop();
    assert_eq!(server.peer_count(), 0);

    // The client sees the connection end.
    let end = timeout(Duration::from_secs(5), async {
        loop {
            match ws_a.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "client connection did not close after stop");

    // The port is free again for the next server.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let again = SignalingServer::start(port, SECRET).await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn rotated_secret_invalidates_the_old_token_after_restart() {
    let (server, port) = start_server(19100).await;
    let (_ws, _) = connect_and_welcome(port).await;

    server.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let new_secret = "fedcba9876543210fedcba9876543210";
    let port = allocate_port(19100, 19150).await.unwrap();
    let server = SignalingServer::start(port, new_secret).await.unwrap();

    let url = format!("ws://127.0.0.1:{port}/?token={SECRET}");
    assert!(
        connect_async(url).await.is_err(),
        "pre-rotation token must be refused"
    );
    assert_eq!(server.peer_count(), 0);

    let mut ws = connect(port, new_secret).await;
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(server.peer_count(), 1);
}

#[tokio::test]
async fn start_fails_cleanly_when_the_port_is_taken() {
    let (server, port) = start_server(19000).await;

    let err = SignalingServer::start(port, SECRET).await;
    assert!(matches!(err, Err(lanmesh::MeshError::Bind { .. })));

    // The original server is unaffected.
    let (_ws, _) = connect_and_welcome(port).await;
    assert_eq!(server.peer_count(), 1);
}
