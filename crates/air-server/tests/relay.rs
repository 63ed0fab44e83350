//! End-to-end tests: the full router over the memory access store.

use air_core::MemoryAccessStore;
use air_server::{app, serve, AppState, Config};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ORIGIN: &str = "https://app.example.com";

fn state() -> Arc<AppState> {
    let store = Arc::new(MemoryAccessStore::new());
    store.add_room("lobby", 1024);
    store.allow_origin("lobby", "app.example.com");
    store.add_token("secret", "lobby", None);
    store.add_token("stale", "lobby", Some(Utc::now() - ChronoDuration::hours(1)));

    store.add_room("small", 12);
    store.add_token("small-token", "small", None);

    store.add_room("big", 8 * 1024 * 1024);
    store.add_token("big-token", "big", None);

    let mut config = Config::default();
    config.metrics.enabled = false;
    config.assets.public_dir = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/public"));

    Arc::new(AppState::new(config, store))
}

async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state, std::future::pending()));
    addr
}

async fn connect(addr: SocketAddr, id: &str, name: &str) -> Client {
    let mut request = format!("ws://{addr}/ws?channel=lobby&id={id}&name={name}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static(ORIGIN));
    let (client, _) = connect_async(request).await.unwrap();
    client
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        match timeout(Duration::from_secs(2), client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

fn user_ids(userlist: &Value) -> Vec<&str> {
    let mut ids: Vec<&str> = userlist["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["id"].as_str().unwrap())
        .collect();
    ids.sort_unstable();
    ids
}

fn emit(token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/emit");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

#[tokio::test]
async fn test_lobby_scenario() {
    let state = state();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect(addr, "u1", "Alice").await;
    assert_eq!(user_ids(&next_json(&mut a).await), vec!["u1"]);

    let mut b = connect(addr, "u2", "Bob").await;
    assert_eq!(
        next_json(&mut a).await,
        json!({ "type": "join", "from": "u2", "sender": "Bob" })
    );
    assert_eq!(user_ids(&next_json(&mut a).await), vec!["u1", "u2"]);
    assert_eq!(user_ids(&next_json(&mut b).await), vec!["u1", "u2"]);

    b.send(Message::Text(
        json!({ "channel": "lobby", "data": "hello" }).to_string(),
    ))
    .await
    .unwrap();
    assert_eq!(
        next_json(&mut a).await,
        json!({ "type": "message", "data": "hello", "from": "u2", "sender": "Bob" })
    );

    let response = app(state.clone())
        .oneshot(emit(Some("Bearer secret"), r#"{"x":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"success":true,"room":"lobby"}"#);
    assert_eq!(next_json(&mut a).await, json!({ "x": 1 }));
    assert_eq!(next_json(&mut b).await, json!({ "x": 1 }));

    a.close(None).await.unwrap();
    assert_eq!(
        next_json(&mut b).await,
        json!({ "type": "leave", "from": "u1", "sender": "Alice" })
    );
    assert_eq!(user_ids(&next_json(&mut b).await), vec!["u2"]);
    assert_eq!(state.registry.stats().connection_count, 1);
}

#[tokio::test]
async fn test_oversized_frame_answered_inline() {
    let state = state();
    let addr = spawn_server(state).await;

    let mut a = connect(addr, "u1", "Alice").await;
    next_json(&mut a).await;

    let big = "x".repeat(2048);
    a.send(Message::Text(
        json!({ "channel": "lobby", "data": big }).to_string(),
    ))
    .await
    .unwrap();

    let error = next_json(&mut a).await;
    let message = error["error"].as_str().unwrap();
    assert!(message.starts_with("Message size "), "{message}");
    assert!(message.ends_with("exceeds room limit of 1024 bytes"), "{message}");
}

#[tokio::test]
async fn test_connect_rejections() {
    let state = state();
    let request = |uri: &str, origin: &str| {
        Request::builder()
            .uri(uri)
            .header(header::ORIGIN, origin)
            .body(Body::empty())
            .unwrap()
    };

    let cases = [
        ("/ws?id=u1&name=A", ORIGIN, StatusCode::BAD_REQUEST, "channel query parameter required"),
        ("/ws?channel=lobby&id=u1", ORIGIN, StatusCode::BAD_REQUEST, "id and name query parameters required"),
        ("/ws?channel=nope&id=u1&name=A", ORIGIN, StatusCode::NOT_FOUND, "Invalid or inactive room"),
        ("/ws?channel=lobby&id=u1&name=A", "https://evil.test", StatusCode::FORBIDDEN, "Origin not allowed"),
    ];

    for (uri, origin, status, text) in cases {
        let response = app(state.clone()).oneshot(request(uri, origin)).await.unwrap();
        assert_eq!(response.status(), status, "{uri}");
        assert_eq!(body_string(response).await, text);
    }

    // Valid parameters without an upgrade request.
    let response = app(state)
        .oneshot(request("/ws?channel=lobby&id=u1&name=A", ORIGIN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_publish_errors() {
    let state = state();

    let response = app(state.clone()).oneshot(emit(None, "{}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(response).await,
        json!({ "error": "Authorization token required", "code": "UNAUTHORIZED" })
    );

    let response = app(state.clone())
        .oneshot(emit(Some("Bearer stale"), r#"{"x":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "Invalid or expired token");

    let response = app(state.clone())
        .oneshot(emit(Some("Bearer nope"), r#"{"x":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app(state.clone())
        .oneshot(emit(Some("Bearer secret"), "[1, 2]"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Invalid JSON");

    // A bare token is accepted too.
    let response = app(state.clone())
        .oneshot(emit(Some("secret"), r#"{"x":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/emit")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body_json(response).await["error"], "Only POST allowed");
}

#[tokio::test]
async fn test_publish_size_boundary() {
    let state = state();

    // Re-serialized as {"x":"aaaa"}: exactly 12 bytes.
    let response = app(state.clone())
        .oneshot(emit(Some("Bearer small-token"), r#"{ "x": "aaaa" }"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app(state)
        .oneshot(emit(Some("Bearer small-token"), r#"{"x":"aaaaa"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(
        body_json(response).await,
        json!({
            "error": "Message size 13 bytes exceeds room limit of 12 bytes",
            "code": "PAYLOAD_TOO_LARGE"
        })
    );
}

#[tokio::test]
async fn test_publish_above_default_body_limit() {
    let state = state();

    // Larger than axum's 2 MiB default, well within the room limit.
    let body = json!({ "x": "a".repeat(3 * 1024 * 1024) }).to_string();
    let response = app(state)
        .oneshot(emit(Some("Bearer big-token"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"success":true,"room":"big"}"#);
}

#[tokio::test]
async fn test_ping_answered_once() {
    let state = state();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect(addr, "u1", "Alice").await;
    next_json(&mut a).await;

    a.send(Message::Ping(b"hb".to_vec())).await.unwrap();
    // Give the pong time to flush before the marker is written.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let response = app(state)
        .oneshot(emit(Some("Bearer secret"), r#"{"marker":true}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut pongs = 0;
    loop {
        match timeout(Duration::from_secs(2), a.next()).await {
            Ok(Some(Ok(Message::Pong(payload)))) => {
                assert_eq!(payload, b"hb");
                pongs += 1;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!({ "marker": true }));
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(pongs, 1);
}

#[tokio::test]
async fn test_client_script_origin_check() {
    let state = state();
    let get = |name: header::HeaderName, value: &str| {
        Request::builder()
            .uri("/air.js")
            .header(name, value)
            .body(Body::empty())
            .unwrap()
    };

    let response = app(state.clone())
        .oneshot(get(header::ORIGIN, ORIGIN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "application/javascript");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);
    assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=3600");
    assert!(body_string(response).await.contains("window.Air"));

    let referer = "https://app.example.com/page";
    let response = app(state.clone())
        .oneshot(get(header::REFERER, referer))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], referer);

    let response = app(state)
        .oneshot(get(header::ORIGIN, "https://evil.test"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_and_static_files() {
    let state = state();

    let response = app(state.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"]["connection_count"], 0);
    assert!(health["dispatch"]["pending"].is_number());

    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/air.prod.js")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
