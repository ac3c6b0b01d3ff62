/// Connection engine tests against a real in-process WebSocket server.
///
/// Validates:
/// - connection_init carries the bearer key; subscribe carries the query
/// - `next` frames stream through with the connection's subscription id
/// - handshake `error` is fatal (no reconnect)
/// - `complete` triggers a reconnect with a fresh subscription id
/// - subscription-phase FORBIDDEN errors terminate the stream
/// - protocol pings are answered with pongs
use std::time::Duration;

use futures_util::{SinkExt, StreamExt, pin_mut};
use polaris_subclient::config::{PolarisConfig, ReconnectConfig};
use polaris_subclient::connection::{PolarisConnection, RawFrame};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type ServerWs = WebSocketStream<TcpStream>;

async fn accept_client(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket accept")
}

async fn read_json(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await.expect("frame").expect("read") {
            Message::Text(t) => return serde_json::from_str(&t).expect("client sends JSON"),
            Message::Ping(d) => {
                let _ = ws.send(Message::Pong(d)).await;
            }
            _ => {}
        }
    }
}

/// Run the server side of the graphql-transport-ws handshake.
async fn server_handshake(ws: &mut ServerWs) -> Value {
    let init = read_json(ws).await;
    assert_eq!(init["type"], "connection_init");
    ws.send(Message::Text(r#"{"type":"connection_ack"}"#.into()))
        .await
        .expect("send ack");
    let subscribe = read_json(ws).await;
    assert_eq!(subscribe["type"], "subscribe");
    subscribe
}

async fn drain(mut ws: ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn device_frame(id: &str, status: &str) -> Message {
    Message::Text(
        json!({
            "id": "1",
            "type": "next",
            "payload": {"data": {"devices": {
                "id": id,
                "services": {"rtk": {"enabled": true, "connectionStatus": status}},
            }}},
        })
        .to_string()
        .into(),
    )
}

fn test_config(addr: std::net::SocketAddr) -> PolarisConfig {
    PolarisConfig {
        api_url: format!("ws://{addr}"),
        api_key: "test-key".to_owned(),
        subscription: "devices".to_owned(),
        reconnect: ReconnectConfig {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 1.0,
            jitter_pct: 0.0,
        },
    }
}

async fn next_frame(
    frames: &mut (impl futures_util::Stream<Item = RawFrame> + Unpin),
) -> Option<RawFrame> {
    timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("frame within deadline")
}

#[tokio::test]
async fn handshake_subscribes_and_streams_next_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        let init = read_json(&mut ws).await;
        assert_eq!(init["type"], "connection_init");
        assert_eq!(init["payload"]["Authorization"], "Bearer test-key");
        ws.send(Message::Text(r#"{"type":"connection_ack"}"#.into()))
            .await
            .unwrap();

        let subscribe = read_json(&mut ws).await;
        assert_eq!(subscribe["type"], "subscribe");
        assert!(!subscribe["id"].as_str().unwrap().is_empty());
        let query = subscribe["payload"]["query"].as_str().unwrap();
        assert!(query.contains("devices"));
        assert!(query.contains("connectionStatus"));

        ws.send(device_frame("d1", "CONNECTED")).await.unwrap();
        ws.send(device_frame("d2", "DISCONNECTED")).await.unwrap();
        drain(ws).await;
    });

    let connection = PolarisConnection::new(test_config(addr));
    let shutdown = connection.shutdown_handle();
    let frames = connection.subscribe();
    pin_mut!(frames);

    let f1 = next_frame(&mut frames).await.expect("first frame");
    assert!(f1.payload.contains("\"d1\""));
    let f2 = next_frame(&mut frames).await.expect("second frame");
    assert!(f2.payload.contains("\"d2\""));
    assert_eq!(f1.subscription_id, f2.subscription_id);

    shutdown.request_shutdown();
    assert!(next_frame(&mut frames).await.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn handshake_error_is_fatal_and_never_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        let _init = read_json(&mut ws).await;
        ws.send(Message::Text(
            r#"{"type":"error","payload":[{"message":"bad credentials"}]}"#.into(),
        ))
        .await
        .unwrap();
        drain(ws).await;
        // A reconnect attempt would hang here; the accept must not fire again.
    });

    let connection = PolarisConnection::new(test_config(addr));
    let frames = connection.subscribe();
    pin_mut!(frames);

    assert!(next_frame(&mut frames).await.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn complete_reconnects_with_a_fresh_subscription_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        let first_sub = server_handshake(&mut ws).await;
        ws.send(device_frame("d1", "CONNECTED")).await.unwrap();
        ws.send(Message::Text(r#"{"id":"1","type":"complete"}"#.into()))
            .await
            .unwrap();
        drain(ws).await;

        let mut ws = accept_client(&listener).await;
        let second_sub = server_handshake(&mut ws).await;
        assert_ne!(first_sub["id"], second_sub["id"]);
        ws.send(device_frame("d2", "CONNECTED")).await.unwrap();
        drain(ws).await;
    });

    let connection = PolarisConnection::new(test_config(addr));
    let shutdown = connection.shutdown_handle();
    let frames = connection.subscribe();
    pin_mut!(frames);

    let f1 = next_frame(&mut frames).await.expect("frame before complete");
    assert!(f1.payload.contains("\"d1\""));
    let f2 = next_frame(&mut frames).await.expect("frame after reconnect");
    assert!(f2.payload.contains("\"d2\""));
    assert_ne!(f1.subscription_id, f2.subscription_id);

    shutdown.request_shutdown();
    assert!(next_frame(&mut frames).await.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn forbidden_subscription_error_terminates_the_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        server_handshake(&mut ws).await;
        ws.send(device_frame("d1", "CONNECTED")).await.unwrap();
        ws.send(Message::Text(
            json!({
                "id": "1",
                "type": "error",
                "payload": [{"message": "revoked", "extensions": {"code": "FORBIDDEN"}}],
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
        drain(ws).await;
    });

    let connection = PolarisConnection::new(test_config(addr));
    let frames = connection.subscribe();
    pin_mut!(frames);

    let f1 = next_frame(&mut frames).await.expect("frame before the error");
    assert!(f1.payload.contains("\"d1\""));
    assert!(next_frame(&mut frames).await.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn non_fatal_subscription_error_is_yielded_and_keeps_streaming() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        server_handshake(&mut ws).await;
        ws.send(Message::Text(
            json!({
                "id": "1",
                "type": "error",
                "payload": [{"message": "hiccup", "extensions": {"code": "INTERNAL"}}],
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
        ws.send(device_frame("d1", "CONNECTED")).await.unwrap();
        drain(ws).await;
    });

    let connection = PolarisConnection::new(test_config(addr));
    let shutdown = connection.shutdown_handle();
    let frames = connection.subscribe();
    pin_mut!(frames);

    let f1 = next_frame(&mut frames).await.expect("error frame is surfaced");
    assert!(f1.payload.contains("hiccup"));
    let f2 = next_frame(&mut frames).await.expect("stream continues");
    assert!(f2.payload.contains("\"d1\""));

    shutdown.request_shutdown();
    assert!(next_frame(&mut frames).await.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn protocol_ping_is_answered_with_pong() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        server_handshake(&mut ws).await;
        ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        let pong = read_json(&mut ws).await;
        assert_eq!(pong["type"], "pong");
        ws.send(device_frame("d1", "CONNECTED")).await.unwrap();
        drain(ws).await;
    });

    let connection = PolarisConnection::new(test_config(addr));
    let shutdown = connection.shutdown_handle();
    let frames = connection.subscribe();
    pin_mut!(frames);

    // The ping itself is not yielded; the device frame follows it.
    let f1 = next_frame(&mut frames).await.expect("device frame");
    assert!(f1.payload.contains("\"d1\""));

    shutdown.request_shutdown();
    assert!(next_frame(&mut frames).await.is_none());
    server.await.unwrap();
}
