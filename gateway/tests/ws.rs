//! End-to-end WebSocket tests: connect/ready, heartbeat, unknown types,
//! inbound republication, and duplicate suppression.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use lumina::bus::EventBus;
use tokio_tungstenite::tungstenite::Message;

async fn start_gateway() -> (Arc<EventBus>, String) {
    let bus = Arc::new(EventBus::new());
    lumina::bus::events::register_builtin_schemas(&bus);
    let state = gateway::GatewayState::new(Arc::clone(&bus));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, gateway::router(state)).await.unwrap();
    });

    (bus, format!("ws://{addr}/lumina/gateway/ws"))
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str) -> WsClient {
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
}

async fn next_json(client: &mut WsClient) -> serde_json::Value {
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn connect_receives_ready_with_fresh_session_id() {
    let (_bus, url) = start_gateway().await;

    let mut first = connect(&url).await;
    let ready = next_json(&mut first).await;
    assert_eq!(ready["type"], "system.ready");
    let first_session = ready["payload"]["session_id"].as_u64().unwrap();

    let mut second = connect(&url).await;
    let ready = next_json(&mut second).await;
    let second_session = ready["payload"]["session_id"].as_u64().unwrap();
    // Session ids are monotonic per connection for interrupt ordering.
    assert!(second_session > first_session);
}

#[tokio::test]
async fn literal_ping_gets_literal_pong() {
    let (_bus, url) = start_gateway().await;
    let mut client = connect(&url).await;
    let _ready = next_json(&mut client).await;

    client
        .send(Message::Text("ping".to_string()))
        .await
        .unwrap();
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                assert_eq!(text, "pong");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn unknown_packet_type_is_echoed_as_status_error() {
    let (_bus, url) = start_gateway().await;
    let mut client = connect(&url).await;
    let _ready = next_json(&mut client).await;

    let packet = serde_json::json!({
        "session_id": 1,
        "type": "teleport_request",
        "source": "test",
        "payload": {}
    });
    client
        .send(Message::Text(packet.to_string()))
        .await
        .unwrap();

    let echo = next_json(&mut client).await;
    assert_eq!(echo["type"], "system_status");
    assert_eq!(echo["payload"]["error"], "unknown_type");
}

#[tokio::test]
async fn input_text_is_republished_on_the_bus() {
    let (bus, url) = start_gateway().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    bus.subscribe_fn("input_text", move |event| {
        let seen = Arc::clone(&seen_clone);
        async move {
            seen.lock().unwrap().push(event.data.clone());
            Ok(())
        }
    });

    let mut client = connect(&url).await;
    let _ready = next_json(&mut client).await;

    let packet = serde_json::json!({
        "session_id": 1,
        "type": "input_text",
        "source": "test",
        "payload": {"text": "hello", "user_id": "u1", "character_id": "alice"}
    });
    client
        .send(Message::Text(packet.to_string()))
        .await
        .unwrap();

    // Give the bus a moment to dispatch.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["payload"]["text"], "hello");
    assert_eq!(seen[0]["session_id"], 1);
}

#[tokio::test]
async fn duplicate_input_text_within_window_is_dropped() {
    let (bus, url) = start_gateway().await;

    let count = Arc::new(Mutex::new(0usize));
    let count_clone = Arc::clone(&count);
    bus.subscribe_fn("input_text", move |_event| {
        let count = Arc::clone(&count_clone);
        async move {
            *count.lock().unwrap() += 1;
            Ok(())
        }
    });

    let mut client = connect(&url).await;
    let _ready = next_json(&mut client).await;

    let packet = serde_json::json!({
        "session_id": 5,
        "type": "input_text",
        "source": "test",
        "payload": {"text": "same message"}
    });
    for _ in 0..2 {
        client
            .send(Message::Text(packet.to_string()))
            .await
            .unwrap();
    }
    // A different session id is not a duplicate.
    let fresh = serde_json::json!({
        "session_id": 6,
        "type": "input_text",
        "source": "test",
        "payload": {"text": "same message"}
    });
    client.send(Message::Text(fresh.to_string())).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(*count.lock().unwrap(), 2);
}

#[tokio::test]
async fn whitelisted_bus_events_reach_the_client() {
    let (bus, url) = start_gateway().await;
    let mut client = connect(&url).await;
    let _ready = next_json(&mut client).await;

    // Bridge-shaped traffic: a full packet as bus data.
    let packet = serde_json::json!({
        "trace_id": "t-1",
        "session_id": 3,
        "type": "brain_response",
        "source": "core.chat_bridge",
        "payload": {"content": "hello "},
        "timestamp": 0.0
    });
    bus.emit("brain_response", packet, "core.chat_bridge").await;

    let received = next_json(&mut client).await;
    assert_eq!(received["type"], "brain_response");
    assert_eq!(received["payload"]["content"], "hello ");
    assert_eq!(received["session_id"], 3);
}

#[tokio::test]
async fn registry_routers_are_mounted_under_their_prefix() {
    use tower::util::ServiceExt;

    let bus = Arc::new(EventBus::new());
    let plugin_router: axum::Router =
        axum::Router::new().route("/status", axum::routing::get(|| async { "ok" }));
    bus.register_service(
        &format!("{}{}", gateway::ROUTER_SERVICE_PREFIX, "/widgets"),
        Arc::new(plugin_router),
    );

    let state = gateway::GatewayState::new(Arc::clone(&bus));
    let app = gateway::router(state);

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/widgets/status")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
}

#[tokio::test]
async fn non_whitelisted_events_are_not_forwarded() {
    let (bus, url) = start_gateway().await;
    let mut client = connect(&url).await;
    let _ready = next_json(&mut client).await;

    bus.emit(
        "plugin.loaded",
        serde_json::json!({"plugin_id": "x", "version": "0.1.0", "enabled": true}),
        "plugin_runtime",
    )
    .await;

    // Nothing should arrive; a short poll window proves the silence.
    let outcome =
        tokio::time::timeout(std::time::Duration::from_millis(300), client.next()).await;
    assert!(outcome.is_err(), "unexpected message: {outcome:?}");
}
