//! Signaling over a real WebSocket against the full router

use axum::body::Body;
use axum::http::{Request, StatusCode};
use confer::http::{create_router, AppState};
use confer_sfu::{EngineConfig, EngineEvent, LocalMediaEngine, SessionProtocol, SfuConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

fn protocol() -> Arc<SessionProtocol> {
    let engine = Arc::new(LocalMediaEngine::new(EngineConfig::default()));
    let protocol = Arc::new(SessionProtocol::new(SfuConfig::default(), engine));
    protocol.spawn_engine_watcher();
    protocol
}

async fn spawn_server(protocol: Arc<SessionProtocol>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = create_router(AppState::new(protocol, 64 * 1024));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    peer_id: String,
    next_id: u64,
    /// Notifications read while waiting for a response
    notifications: Vec<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let mut client = Self {
            ws,
            peer_id: String::new(),
            next_id: 1,
            notifications: Vec::new(),
        };
        let welcome = client.recv().await;
        assert_eq!(welcome["type"], "notification");
        assert_eq!(welcome["event"], "welcome");
        client.peer_id = welcome["data"]["peerId"].as_str().unwrap().to_string();
        client
    }

    async fn recv(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_raw(&mut self, text: String) {
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    async fn response_to(&mut self, id: Value) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] == "response" && frame["id"] == id {
                return frame;
            }
            self.notifications.push(frame);
        }
    }

    async fn request(&mut self, method: &str, data: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let mut frame = json!({ "id": id, "method": method });
        if !data.is_null() {
            frame["data"] = data;
        }
        self.send_raw(frame.to_string()).await;
        self.response_to(json!(id)).await
    }

    /// Next notification, from the backlog first
    async fn notification(&mut self) -> Value {
        if !self.notifications.is_empty() {
            return self.notifications.remove(0);
        }
        self.recv().await
    }

    async fn ok(&mut self, method: &str, data: Value) -> Value {
        let response = self.request(method, data).await;
        assert_eq!(response["ok"], true, "{method} failed: {response}");
        response["data"].clone()
    }

    async fn connected_transport(&mut self, direction: &str) -> String {
        let transport = self
            .ok("createTransport", json!({ "direction": direction }))
            .await;
        let id = transport["id"].as_str().unwrap().to_string();
        let reply = self
            .ok(
                "connectTransport",
                json!({
                    "transportId": id,
                    "dtlsParameters": {
                        "role": "client",
                        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }]
                    }
                }),
            )
            .await;
        assert_eq!(reply, json!({ "connected": true }));
        id
    }
}

fn opus_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 111,
            "clockRate": 48000,
            "channels": 2
        }],
        "encodings": [{ "ssrc": 11111 }]
    })
}

#[tokio::test]
async fn test_welcome_and_capabilities() {
    let addr = spawn_server(protocol()).await;
    let mut client = Client::connect(addr).await;
    assert!(!client.peer_id.is_empty());

    let response = client.request("getCapabilities", Value::Null).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["ok"], true);
    let codecs = response["data"]["codecs"].as_array().unwrap();
    assert!(codecs.iter().any(|c| c["mimeType"] == "audio/opus"));
    assert!(response.get("error").is_none());
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let addr = spawn_server(protocol()).await;
    let mut client = Client::connect(addr).await;

    client
        .send_raw(r#"{"id": 41, "method": "teleport"}"#.to_string())
        .await;
    let response = client.response_to(json!(41)).await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "INVALID_REQUEST");

    client.send_raw("{not json".to_string()).await;
    let response = client.response_to(Value::Null).await;
    assert_eq!(response["error"]["code"], "INVALID_REQUEST");

    let producers = client.ok("getProducers", Value::Null).await;
    assert_eq!(producers, json!([]));
}

#[tokio::test]
async fn test_error_reply_carries_code() {
    let addr = spawn_server(protocol()).await;
    let mut client = Client::connect(addr).await;

    let response = client
        .request(
            "consume",
            json!({ "producerId": "nope", "rtpCapabilities": { "codecs": [] } }),
        )
        .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "NO_RECV_TRANSPORT");
    assert!(response["error"]["message"].is_string());
    assert!(response.get("data").is_none());
}

#[tokio::test]
async fn test_produce_consume_and_leave() {
    let addr = spawn_server(protocol()).await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;

    let send = alice.connected_transport("send").await;
    let produced = alice
        .ok(
            "produce",
            json!({
                "transportId": send,
                "kind": "audio",
                "rtpParameters": opus_parameters(),
                "appData": { "label": "mic" }
            }),
        )
        .await;
    let producer_id = produced["id"].as_str().unwrap().to_string();

    let announced = bob.notification().await;
    assert_eq!(announced["event"], "newProducer");
    assert_eq!(
        announced["data"],
        json!({
            "peerId": alice.peer_id,
            "producerId": producer_id,
            "kind": "audio",
            "appData": { "label": "mic" }
        })
    );

    let listed = bob.ok("getProducers", Value::Null).await;
    assert_eq!(listed[0]["producerId"], producer_id.as_str());

    let caps = bob.ok("getCapabilities", Value::Null).await;
    bob.connected_transport("recv").await;
    let consumer = bob
        .ok(
            "consume",
            json!({ "producerId": producer_id, "rtpCapabilities": caps }),
        )
        .await;
    assert_eq!(consumer["producerId"], producer_id.as_str());
    assert_eq!(consumer["kind"], "audio");
    assert_eq!(consumer["appData"], json!({ "label": "mic" }));
    let consumer_id = consumer["id"].as_str().unwrap().to_string();

    alice.ws.close(None).await.unwrap();

    let left = bob.notification().await;
    assert_eq!(left["event"], "participantLeft");
    assert_eq!(left["data"]["peerId"], alice.peer_id.as_str());

    let closed = bob.notification().await;
    assert_eq!(closed["event"], "consumerClosed");
    assert_eq!(
        closed["data"],
        json!({ "consumerId": consumer_id, "producerId": producer_id })
    );

    let listed = bob.ok("getProducers", Value::Null).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_health_and_stats() {
    let protocol = protocol();
    let router = create_router(AppState::new(Arc::clone(&protocol), 64 * 1024));
    let (_session, _rx) = protocol.connect("observer".into()).unwrap();

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let stats: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["peers"], 1);
    assert_eq!(stats["accepting"], true);

    protocol.handle_engine_event(EngineEvent::Died {
        reason: "test".to_string(),
    });
    let response = router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
