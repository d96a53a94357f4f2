use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing protocol call (client to browser).
#[derive(Debug, Serialize)]
pub struct OutgoingCall {
    /// Message ID used to correlate the reply.
    pub id: u64,
    /// Method name (e.g., `Page.navigate`).
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Present for tab-scoped calls.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Raw incoming message before classification.
///
/// Replies and events share one wire shape; every frame is deserialized
/// into this union first and then split via [`classify`](Self::classify).
#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    /// Present for replies; absent for events.
    pub id: Option<u64>,
    /// Present for events.
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<WireError>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Protocol-level error payload returned by the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct WireError {
    pub code: i64,
    pub message: String,
}

/// A reply to a previously issued call.
#[derive(Debug)]
pub struct Reply {
    pub id: u64,
    pub outcome: Result<Value, WireError>,
}

/// An asynchronous event pushed by the browser.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// Event method name (e.g., `Page.loadEventFired`).
    pub method: String,
    pub params: Value,
    /// Present when the event is scoped to a tab session.
    pub session_id: Option<String>,
}

/// Classified incoming message.
pub enum Incoming {
    Reply(Reply),
    Event(CdpEvent),
}

impl IncomingMessage {
    /// Split this message into a reply (has `id`) or an event (has `method`).
    ///
    /// Returns `None` for frames carrying neither.
    #[must_use]
    pub fn classify(self) -> Option<Incoming> {
        if let Some(id) = self.id {
            let outcome = match self.error {
                Some(error) => Err(error),
                None => Ok(self.result.unwrap_or(Value::Null)),
            };
            Some(Incoming::Reply(Reply { id, outcome }))
        } else if let Some(method) = self.method {
            Some(Incoming::Event(CdpEvent {
                method,
                params: self.params.unwrap_or(Value::Null),
                session_id: self.session_id,
            }))
        } else {
            None
        }
    }
}
