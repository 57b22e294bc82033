//! Diagnostic echo bus (`GET /stream`)
//!
//! A minimal streaming endpoint used by the dashboard for connectivity
//! diagnostics. Accepts JSON frames `{topic, ts, payload}` and echoes each
//! one back with a fresh timestamp and a `received: true` marker merged into
//! the payload. Not part of the provider relay.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tracing::debug;

use crate::registry::ConnectionId;

/// One bus frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusFrame {
    /// Topic label, echoed back verbatim
    pub topic: String,
    /// Sender timestamp (milliseconds); replaced with server time in replies
    pub ts: i64,
    /// Arbitrary payload
    #[serde(default)]
    pub payload: Value,
}

/// Build the echo reply for a raw text frame.
///
/// Malformed frames get a diagnostic error reply rather than silence — this
/// endpoint exists for debugging, so failures should be visible.
pub fn echo_reply(raw: &str, now_ms: i64) -> String {
    match serde_json::from_str::<BusFrame>(raw) {
        Ok(frame) => {
            let mut payload = match frame.payload {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            };
            payload.insert("received".to_string(), json!(true));
            json!({"topic": frame.topic, "ts": now_ms, "payload": payload}).to_string()
        }
        Err(e) => json!({"error": "malformed bus frame", "details": e.to_string()}).to_string(),
    }
}

/// Serve one echo bus client until it disconnects or the process shuts down
pub async fn run(mut socket: WebSocket, id: ConnectionId, mut shutdown: broadcast::Receiver<()>) {
    debug!(session_id = %id, "Echo bus client connected");
    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    let reply = echo_reply(text.as_str(), Utc::now().timestamp_millis());
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let reply = json!({"error": "expected text frame"}).to_string();
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {} // ping/pong, handled by the transport
            },
            _ = shutdown.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }
    debug!(session_id = %id, "Echo bus client disconnected");
}
