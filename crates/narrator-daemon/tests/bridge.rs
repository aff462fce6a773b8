mod common;

use futures_util::{SinkExt, StreamExt};
use narrator_daemon::{bridge::Bridge, config::BridgeConfig};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use common::harness;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect() -> (Bridge, Client) {
    let h = harness();
    let config = BridgeConfig {
        listen_addr: "127.0.0.1:0".into(),
        max_clients: 4,
    };
    let bridge = Bridge::bind(&config, h.service.clone()).await.unwrap();
    let (client, _) = connect_async(format!("ws://{}", bridge.local_addr()))
        .await
        .unwrap();
    (bridge, client)
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Binary(_) => panic!("expected a control message"),
            _ => continue,
        }
    }
}

async fn next_binary(client: &mut Client) -> Vec<u8> {
    match client.next().await.unwrap().unwrap() {
        Message::Binary(bytes) => bytes,
        other => panic!("expected audio, got {other:?}"),
    }
}

async fn send(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn greets_and_answers_queries() {
    let (_bridge, mut client) = connect().await;
    let hello = next_json(&mut client).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["engines"], json!(["kokoro"]));

    send(&mut client, json!({"type": "ping", "nonce": "abc"})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "pong", "nonce": "abc"}));

    send(&mut client, json!({"type": "health"})).await;
    let health = next_json(&mut client).await;
    assert_eq!(health["type"], "health");
    assert_eq!(health["status"], "ok");

    send(&mut client, json!({"type": "voices"})).await;
    let voices = next_json(&mut client).await;
    assert_eq!(voices["voices"]["kokoro"][0], "af_heart");
}

#[tokio::test]
async fn synthesize_sends_header_then_zip() {
    let (_bridge, mut client) = connect().await;
    next_json(&mut client).await;

    let request = json!({
        "type": "synthesize",
        "request_id": "r1",
        "request": {"text": "Hello there. This is a test.", "engine": "kokoro"}
    });
    send(&mut client, request.clone()).await;
    let header = next_json(&mut client).await;
    assert_eq!(header["type"], "package");
    assert_eq!(header["request_id"], "r1");
    assert_eq!(header["file_name"], "tts_output.zip");
    assert_eq!(header["cached"], false);
    let zip = next_binary(&mut client).await;
    assert_eq!(zip.len() as u64, header["size"].as_u64().unwrap());
    assert_eq!(&zip[..2], b"PK");

    send(&mut client, request).await;
    let header = next_json(&mut client).await;
    assert_eq!(header["cached"], true);
    next_binary(&mut client).await;
}

#[tokio::test]
async fn bad_requests_get_error_replies() {
    let (_bridge, mut client) = connect().await;
    next_json(&mut client).await;

    send(
        &mut client,
        json!({"type": "synthesize", "request_id": "r2", "request": {"text": "Hi.", "engine": "piper"}}),
    )
    .await;
    let error = next_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["request_id"], "r2");
    assert_eq!(error["status"], 400);

    client.send(Message::Text("not json".into())).await.unwrap();
    let error = next_json(&mut client).await;
    assert_eq!(error["status"], 400);
    assert_eq!(error["request_id"], Value::Null);

    // The connection survives both.
    send(&mut client, json!({"type": "recommended_engine"})).await;
    assert_eq!(next_json(&mut client).await["type"], "recommended_engine");
}

#[tokio::test]
async fn stream_is_framed_by_start_and_end() {
    let (_bridge, mut client) = connect().await;
    next_json(&mut client).await;

    send(
        &mut client,
        json!({"type": "stream", "request_id": "s1", "request": {"text": "One. Two.", "format": "pcm"}}),
    )
    .await;
    let start = next_json(&mut client).await;
    assert_eq!(start["type"], "stream_start");
    assert_eq!(start["content_type"], "audio/L16");
    assert_eq!(start["headers"]["Cache-Control"], "no-store");

    let mut received = 0u64;
    let end = loop {
        match client.next().await.unwrap().unwrap() {
            Message::Binary(bytes) => {
                assert_eq!(bytes.len() % 2, 0);
                received += bytes.len() as u64;
            }
            Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
            _ => {}
        }
    };
    assert_eq!(end["type"], "stream_end");
    assert_eq!(end["request_id"], "s1");
    assert_eq!(end["bytes"].as_u64().unwrap(), received);
    assert_eq!(end["error"], Value::Null);
}
