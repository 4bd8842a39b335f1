//! End-to-end tests against a listening server, using a real WebSocket client
//! and HTTP client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use keyrelay_broker::{MemoryBroker, SessionManager};
use keyrelay_core::KeyExpr;
use keyrelay_relay::{Relay, RelayConfig};
use keyrelay_server::config::ServerConfig;
use keyrelay_server::rpc::handlers::register_all;
use keyrelay_server::rpc::registry::MethodRegistry;
use keyrelay_server::server::KeyRelayServer;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    broker: MemoryBroker,
    server: KeyRelayServer,
    http: String,
    ws: String,
}

async fn boot_with(config: ServerConfig, connect: bool) -> TestServer {
    let broker = MemoryBroker::with_storage();
    let session = SessionManager::new(Arc::new(broker.clone()));
    let relay = Relay::new(session, RelayConfig::default());
    if connect {
        relay.connect().await.unwrap();
    }

    let mut registry = MethodRegistry::new().with_timeout(config.rpc_timeout);
    register_all(&mut registry);
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();
    let server = KeyRelayServer::new(config, relay, registry, metrics_handle);
    let (addr, _handle) = server.listen().await.unwrap();

    TestServer {
        broker,
        server,
        http: format!("http://{addr}"),
        ws: format!("ws://{addr}/ws"),
    }
}

async fn boot() -> TestServer {
    boot_with(ServerConfig::default(), true).await
}

fn ke(s: &str) -> KeyExpr {
    KeyExpr::new(s).unwrap()
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read until a frame of `event_type` arrives.
async fn read_event(ws: &mut WsStream, event_type: &str) -> Value {
    loop {
        let msg = read_json(ws).await;
        if msg["type"] == event_type {
            return msg;
        }
    }
}

/// Send a request and read until the response with the same id.
async fn rpc_call(ws: &mut WsStream, id: &str, method: &str, params: Value) -> Value {
    let req = json!({"id": id, "method": method, "params": params});
    ws.send(Message::text(req.to_string())).await.unwrap();
    loop {
        let parsed = read_json(ws).await;
        if parsed["id"] == id {
            return parsed;
        }
    }
}

/// Connect and consume the greeting frames.
async fn connect_ready(url: &str) -> WsStream {
    let mut ws = connect(url).await;
    let _ = read_event(&mut ws, "connection.established").await;
    let _ = read_event(&mut ws, "relay.status").await;
    ws
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ── WebSocket ──

#[tokio::test]
async fn greets_with_client_id_then_status() {
    let t = boot().await;
    let mut ws = connect(&t.ws).await;

    let first = read_json(&mut ws).await;
    assert_eq!(first["type"], "connection.established");
    assert!(first["data"]["clientId"].is_string());
    assert!(first["timestamp"].is_string());

    let second = read_json(&mut ws).await;
    assert_eq!(second["type"], "relay.status");
    assert_eq!(second["data"]["status"], "connected");
}

#[tokio::test]
async fn subscribe_then_receive_samples() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;

    let resp = rpc_call(&mut ws, "s1", "relay.subscribe", json!({"pattern": "sensor/*"})).await;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["result"]["pattern"], "sensor/*");
    assert_eq!(t.broker.subscriber_patterns(), vec![ke("sensor/*")]);

    t.broker.put(&ke("sensor/t1"), "21.5");
    let sample = read_event(&mut ws, "relay.sample").await;
    assert_eq!(sample["data"]["key"], "sensor/t1");
    assert_eq!(sample["data"]["value"], "21.5");
}

#[tokio::test]
async fn new_clients_follow_default_subscription() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;
    assert_eq!(t.broker.subscriber_patterns(), vec![ke("test/**")]);

    t.broker.put(&ke("test/a/b"), "hello");
    let sample = read_event(&mut ws, "relay.sample").await;
    assert_eq!(sample["data"]["key"], "test/a/b");
}

#[tokio::test]
async fn clients_on_one_pattern_share_a_declaration() {
    let t = boot().await;
    let mut a = connect_ready(&t.ws).await;
    let mut b = connect_ready(&t.ws).await;

    let _ = rpc_call(&mut a, "1", "relay.subscribe", json!({"pattern": "room/**"})).await;
    let _ = rpc_call(&mut b, "1", "relay.subscribe", json!({"pattern": "room/**"})).await;
    assert_eq!(t.broker.subscriber_patterns(), vec![ke("room/**")]);

    t.broker.put(&ke("room/1/temp"), "20");
    assert_eq!(read_event(&mut a, "relay.sample").await["data"]["value"], "20");
    assert_eq!(read_event(&mut b, "relay.sample").await["data"]["value"], "20");
}

#[tokio::test]
async fn switching_pattern_replaces_declaration() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;

    let _ = rpc_call(&mut ws, "1", "relay.subscribe", json!({"pattern": "a/*"})).await;
    let _ = rpc_call(&mut ws, "2", "relay.subscribe", json!({"pattern": "b/*"})).await;
    assert_eq!(t.broker.subscriber_patterns(), vec![ke("b/*")]);

    let resp = rpc_call(&mut ws, "3", "relay.unsubscribe", json!({})).await;
    assert_eq!(resp["result"]["pattern"], "b/*");
    assert!(t.broker.subscriber_patterns().is_empty());
}

#[tokio::test]
async fn disconnect_releases_pattern() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;
    let _ = rpc_call(&mut ws, "1", "relay.subscribe", json!({"pattern": "gone/*"})).await;
    assert_eq!(t.server.relay().stats().channels, 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let broker = t.broker.clone();
    wait_until(move || broker.subscriber_patterns().is_empty()).await;
    let relay = Arc::clone(t.server.relay());
    wait_until(move || relay.stats().channels == 0).await;
}

#[tokio::test]
async fn invalid_key_is_rejected_over_rpc() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;
    let resp = rpc_call(&mut ws, "x", "relay.subscribe", json!({"pattern": "a//b"})).await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"]["code"], "INVALID_PARAMS");
}

#[tokio::test]
async fn connection_cap_refuses_upgrade() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let t = boot_with(config, true).await;
    let _first = connect_ready(&t.ws).await;
    assert!(connect_async(t.ws.as_str()).await.is_err());
}

#[tokio::test]
async fn shutdown_closes_sockets() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;
    t.server.shutdown().cancel();

    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn stop_refuses_clients_then_closes_relay() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;
    assert_eq!(t.broker.session_count(), 1);

    t.server.shutdown().stop(Vec::new(), Some(TIMEOUT)).await;
    assert!(t.server.relay().is_closed());
    assert_eq!(t.server.relay().stats().channels, 0);
    assert_eq!(t.broker.session_count(), 0);

    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(connect_async(t.ws.as_str()).await.is_err());

    let resp = reqwest::Client::new()
        .post(format!("{}/connect", t.http))
        .send()
        .await;
    if let Ok(resp) = resp {
        assert_eq!(resp.status(), 503);
    }
    assert_eq!(t.broker.session_count(), 0);
}

#[tokio::test]
async fn status_frames_follow_broker_loss() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;
    assert_eq!(t.broker.sever_sessions(), 1);

    loop {
        let status = read_event(&mut ws, "relay.status").await;
        if status["data"]["status"] == "failed" {
            break;
        }
    }
}

// ── HTTP ──

#[tokio::test]
async fn health_reports_connections() {
    let t = boot().await;
    let _ws = connect_ready(&t.ws).await;

    let body: Value = reqwest::get(format!("{}/health", t.http))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["broker"], "connected");
    assert_eq!(body["connections"], 1);
}

#[tokio::test]
async fn http_publish_reaches_ws_subscriber() {
    let t = boot().await;
    let mut ws = connect_ready(&t.ws).await;
    let _ = rpc_call(&mut ws, "1", "relay.subscribe", json!({"pattern": "cmd/**"})).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/publish", t.http))
        .json(&json!({"key": "cmd/led", "value": "on"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let sample = read_event(&mut ws, "relay.sample").await;
    assert_eq!(sample["data"], json!({
        "key": "cmd/led",
        "value": "on",
        "timestamp": sample["data"]["timestamp"],
    }));
}

#[tokio::test]
async fn http_query_reads_storage() {
    let t = boot().await;
    t.broker.put(&ke("store/a"), "1");
    t.broker.put(&ke("store/b"), "2");

    let body: Value = reqwest::get(format!("{}/query?key=store/*", t.http))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let mut keys: Vec<&str> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["key"].as_str().unwrap())
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, ["store/a", "store/b"]);
    assert_eq!(body["complete"], true);
}

#[tokio::test]
async fn http_connect_brings_relay_up() {
    let t = boot_with(ServerConfig::default(), false).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/publish", t.http))
        .json(&json!({"key": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let body: Value = client
        .post(format!("{}/connect", t.http))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "connected");
    assert_eq!(t.broker.session_count(), 1);
}
