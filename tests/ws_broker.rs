//! WebSocket broker behavior that needs no backend: error envelopes,
//! subscription edge cases, and watch registration rules.

use dosprobe::server::{router, AppState, CaptureDirs};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> SocketAddr {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = CaptureDirs {
        captures: tmp.path().join("captures"),
        golden: tmp.path().join("golden"),
    };
    let state = AppState::new(None, dirs);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _tmp = tmp; // keep scratch dirs alive for the server's lifetime
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    client
}

async fn send(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame within bound")
            .expect("stream open")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn one_shot_errors_carry_the_request_id() {
    let addr = serve().await;
    let mut client = connect(addr).await;

    send(
        &mut client,
        json!({ "type": "registers:read", "requestId": "r1" }),
    )
    .await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["requestId"], "r1");
    assert!(frame["message"].as_str().unwrap().contains("no backend"));

    // the connection stays open after an error
    send(
        &mut client,
        json!({ "type": "registers:read", "requestId": "r2" }),
    )
    .await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["requestId"], "r2");
}

#[tokio::test]
async fn malformed_messages_produce_an_error_envelope() {
    let addr = serve().await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert!(frame.get("requestId").is_none());
}

#[tokio::test]
async fn unknown_channels_and_repeat_unsubscribes_are_ignored() {
    let addr = serve().await;
    let mut client = connect(addr).await;

    send(&mut client, json!({ "type": "subscribe", "channel": "bogus" })).await;
    send(&mut client, json!({ "type": "unsubscribe", "channel": "memory" })).await;
    send(&mut client, json!({ "type": "unsubscribe", "channel": "memory" })).await;

    // probe: the very next frame must be the probe's reply, proving the
    // three messages above produced nothing
    send(
        &mut client,
        json!({ "type": "registers:read", "requestId": "probe" }),
    )
    .await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["requestId"], "probe");
}

#[tokio::test]
async fn watch_registration_reports_the_clamped_interval() {
    let addr = serve().await;
    let mut client = connect(addr).await;

    send(
        &mut client,
        json!({
            "type": "memory:watch",
            "id": "w",
            "address": "0xB8000",
            "size": 4,
            "intervalMs": 50,
        }),
    )
    .await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "memory:watching");
    assert_eq!(frame["id"], "w");
    assert_eq!(frame["intervalMs"], 200);
}

#[tokio::test]
async fn watch_with_a_bad_address_is_rejected() {
    let addr = serve().await;
    let mut client = connect(addr).await;

    send(
        &mut client,
        json!({
            "type": "memory:watch",
            "id": "w",
            "address": "not-an-address",
            "size": 4,
        }),
    )
    .await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert!(frame["message"].as_str().unwrap().contains("not-an-address"));
}

#[tokio::test]
async fn unexpected_client_binary_frames_are_dropped() {
    let addr = serve().await;
    let mut client = connect(addr).await;

    client
        .send(Message::Binary(vec![1, 2, 3]))
        .await
        .unwrap();
    send(
        &mut client,
        json!({ "type": "registers:read", "requestId": "after-binary" }),
    )
    .await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["requestId"], "after-binary");
}
