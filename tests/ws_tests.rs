//! End-to-end relay tests over real WebSocket connections.

mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use common::TestServer;
use courier::ws::RelaySettings;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(server: &TestServer) -> WsClient {
    let (socket, _) = connect_async(server.ws_url()).await.expect("connect");
    socket
}

async fn send_json(client: &mut WsClient, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

/// Read frames until the next text frame, skipping pings.
async fn recv_json(client: &mut WsClient) -> Value {
    let deadline = tokio::time::Duration::from_secs(2);
    loop {
        let frame = tokio::time::timeout(deadline, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid json"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn init(client: &mut WsClient, server: &TestServer, user_id: &str) -> Value {
    send_json(
        client,
        json!({
            "dataType": "InitData",
            "data": { "token": server.token_for(user_id), "userId": user_id }
        }),
    )
    .await;
    recv_json(client).await
}

#[tokio::test]
async fn test_init_returns_inbox() {
    let server = TestServer::spawn().await;
    let mut client = connect(&server).await;

    let reply = init(&mut client, &server, "alice").await;
    assert_eq!(reply["dataType"], "InboxData");
    assert_eq!(reply["data"]["threads"], json!([]));
}

#[tokio::test]
async fn test_init_with_bad_token() {
    let server = TestServer::spawn().await;
    let mut client = connect(&server).await;

    send_json(
        &mut client,
        json!({
            "dataType": "InitData",
            "data": { "token": "not-a-token", "userId": "alice" }
        }),
    )
    .await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["dataType"], "ErrorData");
    assert_eq!(reply["data"]["code"], "InvalidToken");

    // The connection survives and can still authenticate.
    let reply = init(&mut client, &server, "alice").await;
    assert_eq!(reply["dataType"], "InboxData");
}

#[tokio::test]
async fn test_message_before_init_is_rejected() {
    let server = TestServer::spawn().await;
    let mut client = connect(&server).await;

    send_json(
        &mut client,
        json!({
            "dataType": "MessageData",
            "data": {
                "senderId": "alice",
                "receiverId": "bob",
                "messageType": "text",
                "messageBody": "sneaky"
            }
        }),
    )
    .await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["dataType"], "ErrorData");
    assert_eq!(reply["data"]["code"], "InvalidToken");
}

#[tokio::test]
async fn test_message_delivered_to_both_parties() {
    let server = TestServer::spawn().await;

    let mut alice = connect(&server).await;
    init(&mut alice, &server, "alice").await;
    let mut bob = connect(&server).await;
    init(&mut bob, &server, "bob").await;

    send_json(
        &mut alice,
        json!({
            "dataType": "MessageData",
            "data": {
                "senderId": "alice",
                "receiverId": "bob",
                "messageType": "text",
                "messageBody": "hello bob"
            }
        }),
    )
    .await;

    let delivered = recv_json(&mut bob).await;
    assert_eq!(delivered["dataType"], "MessageData");
    assert_eq!(delivered["data"]["messageBody"], "hello bob");
    // Server stamped routing metadata.
    assert!(delivered["data"]["threadId"].as_str().is_some_and(|t| !t.is_empty()));
    assert!(delivered["data"]["createdAt"].as_str().is_some());

    // The sender gets the same echo.
    let echo = recv_json(&mut alice).await;
    assert_eq!(echo["dataType"], "MessageData");
    assert_eq!(echo["data"]["threadId"], delivered["data"]["threadId"]);
}

#[tokio::test]
async fn test_offline_messages_appear_in_inbox_on_next_init() {
    let server = TestServer::spawn().await;

    let mut alice = connect(&server).await;
    init(&mut alice, &server, "alice").await;

    // Bob is offline; the message is stored anyway.
    send_json(
        &mut alice,
        json!({
            "dataType": "MessageData",
            "data": {
                "senderId": "alice",
                "receiverId": "bob",
                "messageType": "text",
                "messageBody": "read this later"
            }
        }),
    )
    .await;
    recv_json(&mut alice).await; // echo

    let mut bob = connect(&server).await;
    let inbox = init(&mut bob, &server, "bob").await;
    let threads = inbox["data"]["threads"].as_array().expect("threads");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["messages"][0]["messageBody"], "read this later");
}

#[tokio::test]
async fn test_thread_query_pages_history() {
    let server = TestServer::spawn().await;

    let mut alice = connect(&server).await;
    init(&mut alice, &server, "alice").await;

    let mut thread_id = String::new();
    for i in 0..3 {
        send_json(
            &mut alice,
            json!({
                "dataType": "MessageData",
                "data": {
                    "senderId": "alice",
                    "receiverId": "bob",
                    "messageType": "text",
                    "messageBody": format!("m{i}")
                }
            }),
        )
        .await;
        let echo = recv_json(&mut alice).await;
        thread_id = echo["data"]["threadId"].as_str().unwrap().to_string();
    }

    send_json(
        &mut alice,
        json!({
            "dataType": "ThreadData",
            "data": { "threadId": thread_id, "limit": 2, "skip": 1 }
        }),
    )
    .await;

    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["dataType"], "ThreadData");
    let page = reply["data"].as_array().expect("page");
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["messageBody"], "m1");
    assert_eq!(page[1]["messageBody"], "m0");
}

#[tokio::test]
async fn test_unknown_data_type() {
    let server = TestServer::spawn().await;
    let mut client = connect(&server).await;

    send_json(
        &mut client,
        json!({ "dataType": "PresenceData", "data": {} }),
    )
    .await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["dataType"], "ErrorData");
    assert_eq!(reply["data"]["code"], "InvalidDataType");
}

#[tokio::test]
async fn test_malformed_frame() {
    let server = TestServer::spawn().await;
    let mut client = connect(&server).await;

    client
        .send(Message::Text("this is not json".into()))
        .await
        .expect("send");

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["dataType"], "ErrorData");
    assert_eq!(reply["data"]["code"], "InvalidData");
}

#[tokio::test]
async fn test_system_token_bypass() {
    let server = TestServer::spawn().await;
    let mut client = connect(&server).await;

    send_json(
        &mut client,
        json!({
            "dataType": "InitData",
            "data": { "token": "test-system-token", "userId": "system" }
        }),
    )
    .await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["dataType"], "InboxData");
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    // Short idle deadline, ping pushed far out so nothing resets it.
    let server = TestServer::spawn_with(RelaySettings {
        read_idle: Duration::from_millis(300),
        ping_interval: Duration::from_secs(30),
        ..RelaySettings::default()
    })
    .await;
    let mut client = connect(&server).await;

    // Send nothing; the server must treat the connection as dead.
    let frame = tokio::time::timeout(Duration::from_secs(3), client.next())
        .await
        .expect("server did not close the idle connection");
    match frame {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = TestServer::spawn().await;

    // Plain HTTP GET, no websocket involved.
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = TcpStream::connect(server.addr).await.expect("connect");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
}
