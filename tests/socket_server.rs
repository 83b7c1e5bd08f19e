//! Websocket Front End Tests
//!
//! Drives a real listener over loopback: handshake authentication,
//! request replies and pushed deliveries.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aerolive::config::SocketConfig;
use aerolive::socket::{SocketServer, TokenVerifier};
use common::engine;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "test-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Helper Functions
// =============================================================================

fn token(identity: &str) -> String {
    encode(
        &Header::default(),
        &json!({"owner_id": identity}),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn serve() -> (Arc<SocketServer>, String) {
    let server = Arc::new(SocketServer::new(
        engine().await,
        TokenVerifier::new(SECRET, None),
        SocketConfig::default(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let running = Arc::clone(&server);
    tokio::spawn(async move { running.serve(listener).await });
    (server, url)
}

async fn connect(url: &str, identity: &str) -> Client {
    let (ws, _) = connect_async(format!("{}?token={}", url, token(identity)))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames
async fn recv(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read `n` frames and split them into replies and pushes
async fn recv_split(ws: &mut Client, n: usize) -> (Vec<Value>, Vec<Value>) {
    let mut replies = Vec::new();
    let mut pushes = Vec::new();
    for _ in 0..n {
        match recv(ws).await {
            Value::Array(messages) => pushes.extend(messages),
            reply => replies.push(reply),
        }
    }
    (replies, pushes)
}

// =============================================================================
// Handshake
// =============================================================================

/// Connections without a valid token are refused during the handshake.
#[tokio::test]
async fn test_handshake_requires_token() {
    let (server, url) = serve().await;

    match connect_async(url.as_str()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    let forged = encode(
        &Header::default(),
        &json!({"owner_id": "alice"}),
        &EncodingKey::from_secret(b"wrong"),
    )
    .unwrap();
    let result = connect_async(format!("{}?token={}", url, forged)).await;
    assert!(matches!(result, Err(WsError::Http(_))));

    server.shutdown();
}

/// The token may also travel in the Authorization header.
#[tokio::test]
async fn test_bearer_header_is_accepted() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let (server, url) = serve().await;
    let mut request = url.as_str().into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {}", token("alice")).parse().unwrap(),
    );
    let (mut ws, _) = connect_async(request).await.unwrap();

    send(&mut ws, json!({"type": "subscribe", "messageID": "m1", "query": {}})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "success");
    assert!(reply["queryID"].is_string());
    server.shutdown();
}

// =============================================================================
// Requests and Pushes
// =============================================================================

/// Subscribe, create, then observe the live push.
#[tokio::test]
async fn test_subscribe_and_receive_updates() {
    let (server, url) = serve().await;
    let mut ws = connect(&url, "alice").await;

    send(
        &mut ws,
        json!({"type": "subscribe", "messageID": "m1", "query": {"kind": "note"}, "queryID": "notes"}),
    )
    .await;
    let (replies, pushes) = recv_split(&mut ws, 2).await;
    assert_eq!(replies, vec![json!({"type": "success", "messageID": "m1", "queryID": "notes"})]);
    assert_eq!(pushes[0]["type"], "updates");
    assert_eq!(pushes[0]["historical"], true);
    assert_eq!(pushes[0]["complete"], true);

    send(
        &mut ws,
        json!({
            "type": "update",
            "messageID": "m2",
            "object": {"_to": ["alice"], "kind": "note", "title": "hi"}
        }),
    )
    .await;
    let (replies, pushes) = recv_split(&mut ws, 2).await;
    assert_eq!(replies[0]["type"], "success");
    assert_eq!(replies[0]["messageID"], "m2");
    let id = replies[0]["objectID"].as_str().unwrap().to_string();

    assert_eq!(pushes[0]["type"], "updates");
    assert_eq!(pushes[0]["queryId"], "notes");
    assert_eq!(pushes[0]["results"][0]["_id"], id.as_str());
    assert_eq!(pushes[0]["results"][0]["_by"], "alice");
    assert_eq!(pushes[0]["results"][0]["title"], "hi");

    send(&mut ws, json!({"type": "delete", "messageID": "m3", "objectID": id})).await;
    let (replies, pushes) = recv_split(&mut ws, 2).await;
    assert_eq!(replies[0], json!({"type": "success", "messageID": "m3"}));
    assert_eq!(pushes[0], json!({"type": "deletes", "queryId": "notes", "results": [id]}));

    server.shutdown();
}

/// Failed requests are answered with a reason and do not close the socket.
#[tokio::test]
async fn test_errors_are_replies() {
    let (server, url) = serve().await;
    let mut ws = connect(&url, "alice").await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["reason"], "validation");
    assert!(reply.get("messageID").is_none());

    send(
        &mut ws,
        json!({"type": "subscribe", "messageID": "m1", "query": {"_to": "bob"}}),
    )
    .await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["messageID"], "m1");
    assert_eq!(reply["reason"], "validation");
    assert!(reply["detail"].as_str().unwrap().contains("bob"));

    send(
        &mut ws,
        json!({"type": "update", "messageID": "m2", "object": {"_to": ["bob"], "n": 1}}),
    )
    .await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["reason"], "validation");

    send(&mut ws, json!({"type": "delete", "messageID": "m3", "objectID": "missing"})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["reason"], "not_found");

    server.shutdown();
}

/// Pushes are scoped to the subscribing socket's own queries.
#[tokio::test]
async fn test_pushes_reach_only_subscribers() {
    let (server, url) = serve().await;
    let mut alice = connect(&url, "alice").await;
    let mut bob = connect(&url, "bob").await;

    send(
        &mut bob,
        json!({"type": "subscribe", "messageID": "b1", "query": {"_to": "bob"}, "queryID": "mine"}),
    )
    .await;
    recv_split(&mut bob, 2).await;

    send(
        &mut alice,
        json!({"type": "update", "messageID": "a1", "object": {"_to": ["alice", "bob"], "msg": "hey"}}),
    )
    .await;
    assert_eq!(recv(&mut alice).await["type"], "success");

    let push = recv(&mut bob).await;
    assert_eq!(push[0]["queryId"], "mine");
    assert_eq!(push[0]["results"][0]["msg"], "hey");
    assert_eq!(push[0]["results"][0]["_to"], json!(["alice", "bob"]));

    server.shutdown();
}
