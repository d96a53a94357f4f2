//! Integration tests for the CDP WebSocket client.
//!
//! Each test spins up a mock WebSocket server with scripted behavior,
//! connects a `CdpClient`, and verifies the expected interactions.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use noticescan::cdp::{CdpClient, CdpConfig, CdpError};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

// =============================================================================
// Mock server helpers
// =============================================================================

/// Start a mock CDP server driven by a handler that maps each incoming
/// command to a list of frames to send back (events first, reply last).
async fn start_server(
    handler: fn(&Value) -> Vec<Value>,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(msg)) = source.next().await {
                    if let Message::Text(text) = msg {
                        let cmd: Value = serde_json::from_str(&text).unwrap();
                        for frame in handler(&cmd) {
                            sink.send(Message::Text(frame.to_string().into()))
                                .await
                                .unwrap();
                        }
                    }
                }
            });
        }
    });
    (addr, handle)
}

/// Replies `{"id": N, "result": {}}` to every command.
fn echo(cmd: &Value) -> Vec<Value> {
    vec![json!({ "id": cmd["id"], "result": {} })]
}

/// Never replies.
fn silent(_cmd: &Value) -> Vec<Value> {
    Vec::new()
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}")
}

fn quick_config() -> CdpConfig {
    CdpConfig {
        connect_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_millis(300),
        channel_capacity: 16,
    }
}

// =============================================================================
// Calls
// =============================================================================

#[tokio::test]
async fn call_round_trips_a_reply() {
    let (addr, _server) = start_server(echo).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let result = client.call("Browser.getVersion", None).await.unwrap();
    assert_eq!(result, json!({}));
}

#[tokio::test]
async fn call_carries_params() {
    fn reply_with_params(cmd: &Value) -> Vec<Value> {
        vec![json!({ "id": cmd["id"], "result": { "sawUrl": cmd["params"]["url"] } })]
    }
    let (addr, _server) = start_server(reply_with_params).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let result = client
        .call(
            "Page.navigate",
            Some(json!({ "url": "https://example.com" })),
        )
        .await
        .unwrap();
    assert_eq!(result["sawUrl"], "https://example.com");
}

#[tokio::test]
async fn protocol_error_surfaces_as_error() {
    fn reject(cmd: &Value) -> Vec<Value> {
        vec![json!({
            "id": cmd["id"],
            "error": { "code": -32000, "message": "No node with given id found" },
        })]
    }
    let (addr, _server) = start_server(reject).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let err = client.call("DOM.resolveNode", None).await.unwrap_err();
    match err {
        CdpError::Protocol { code, message } => {
            assert_eq!(code, -32000);
            assert_eq!(message, "No node with given id found");
        }
        other => panic!("expected protocol error, got {other}"),
    }
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let (addr, _server) = start_server(silent).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let err = client.call("Page.navigate", None).await.unwrap_err();
    match &err {
        CdpError::CallTimeout { method } => assert_eq!(method, "Page.navigate"),
        other => panic!("expected call timeout, got {other}"),
    }
    assert!(err.is_timeout());
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    // bind and drop a listener so the port is closed
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CdpError::Connection(_) | CdpError::ConnectionTimeout
    ));
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn events_reach_subscribers() {
    fn emit_then_reply(cmd: &Value) -> Vec<Value> {
        vec![
            json!({ "method": "Page.loadEventFired", "params": { "timestamp": 1.0 } }),
            json!({ "id": cmd["id"], "result": {} }),
        ]
    }
    let (addr, _server) = start_server(emit_then_reply).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let mut rx = client.subscribe("Page.loadEventFired").await.unwrap();
    client.call("Page.enable", None).await.unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.method, "Page.loadEventFired");
    assert_eq!(event.params["timestamp"], 1.0);
}

#[tokio::test]
async fn unrelated_events_are_not_delivered() {
    fn emit_other_then_reply(cmd: &Value) -> Vec<Value> {
        vec![
            json!({ "method": "Network.requestWillBeSent", "params": {} }),
            json!({ "id": cmd["id"], "result": {} }),
        ]
    }
    let (addr, _server) = start_server(emit_other_then_reply).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let mut rx = client.subscribe("Page.loadEventFired").await.unwrap();
    client.call("Network.enable", None).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(delivered.is_err(), "no event should have been delivered");
}

// =============================================================================
// Sessions
// =============================================================================

fn session_server(cmd: &Value) -> Vec<Value> {
    let method = cmd["method"].as_str().unwrap_or_default();
    match method {
        "Target.attachToTarget" => {
            vec![json!({ "id": cmd["id"], "result": { "sessionId": "sess-42" } })]
        }
        "Page.enable" => vec![
            json!({
                "method": "Page.loadEventFired",
                "params": { "timestamp": 2.0 },
                "sessionId": cmd["sessionId"],
            }),
            json!({ "id": cmd["id"], "result": {}, "sessionId": cmd["sessionId"] }),
        ],
        _ => vec![json!({
            "id": cmd["id"],
            "result": { "echoedSession": cmd["sessionId"] },
            "sessionId": cmd["sessionId"],
        })],
    }
}

#[tokio::test]
async fn attach_yields_a_scoped_session() {
    let (addr, _server) = start_server(session_server).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let session = client.attach("target-1").await.unwrap();
    assert_eq!(session.session_id(), "sess-42");

    let result = session.call("Runtime.evaluate", None).await.unwrap();
    assert_eq!(result["echoedSession"], "sess-42");
}

#[tokio::test]
async fn session_scoped_events_reach_session_subscribers() {
    let (addr, _server) = start_server(session_server).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let session = client.attach("target-1").await.unwrap();
    let mut rx = session.subscribe("Page.loadEventFired").await.unwrap();
    session.call("Page.enable", None).await.unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.method, "Page.loadEventFired");
    assert_eq!(event.session_id.as_deref(), Some("sess-42"));
}

#[tokio::test]
async fn browser_level_subscriber_misses_session_scoped_events() {
    let (addr, _server) = start_server(session_server).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();

    let session = client.attach("target-1").await.unwrap();
    let mut browser_rx = client.subscribe("Page.loadEventFired").await.unwrap();
    session.call("Page.enable", None).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_millis(200), browser_rx.recv()).await;
    assert!(delivered.is_err(), "session event leaked to browser scope");
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn close_shuts_the_transport_down() {
    let (addr, _server) = start_server(echo).await;
    let client = CdpClient::connect(&ws_url(addr), quick_config())
        .await
        .unwrap();
    client.close().await.unwrap();
}
