//! Message forwarder
//!
//! Relays frames unmodified between the two sides of a session pair. Each
//! direction is a pump over `Stream`/`Sink` halves of a transport-neutral
//! [`Frame`], so ordering and teardown behavior are testable with plain
//! channels. A pump holds at most one frame in flight: a slow peer suspends
//! the read side instead of growing a queue.

use axum::extract::ws::Message as ClientMessage;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, trace, warn};

use crate::registry::ConnectionId;

/// One discrete data frame, independent of which WebSocket library carried it.
///
/// Ping/pong never appear here: both transports answer them at the protocol
/// layer, and relaying them across would conflate the two connections'
/// liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload (JSON events in the provider protocol)
    Text(String),
    /// Binary payload (audio chunks)
    Binary(Bytes),
    /// Close signal from the peer
    Close,
}

/// Which way a pump moves frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Browser → provider
    ClientToUpstream,
    /// Provider → browser
    UpstreamToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::ClientToUpstream => "client->upstream",
            Self::UpstreamToClient => "upstream->client",
        }
    }
}

/// Why a pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The read side closed cleanly (close frame or end of stream)
    SourceClosed,
    /// The read side reported a transport error
    SourceError,
    /// The write side refused a frame (its socket is gone)
    SinkClosed,
}

/// Convert an inbound client message. `None` for ping/pong, which the
/// transport layer already answered.
pub fn from_client(msg: ClientMessage) -> Option<Frame> {
    match msg {
        ClientMessage::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        ClientMessage::Binary(data) => Some(Frame::Binary(data)),
        ClientMessage::Close(_) => Some(Frame::Close),
        ClientMessage::Ping(_) | ClientMessage::Pong(_) => None,
    }
}

/// Convert a frame for delivery to the client socket
pub fn to_client(frame: Frame) -> ClientMessage {
    match frame {
        Frame::Text(text) => ClientMessage::Text(text.into()),
        Frame::Binary(data) => ClientMessage::Binary(data),
        Frame::Close => ClientMessage::Close(None),
    }
}

/// Convert an inbound provider message. `None` for ping/pong and raw frames.
pub fn from_upstream(msg: UpstreamMessage) -> Option<Frame> {
    match msg {
        UpstreamMessage::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        UpstreamMessage::Binary(data) => Some(Frame::Binary(data)),
        UpstreamMessage::Close(_) => Some(Frame::Close),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}

/// Convert a frame for delivery to the upstream socket
pub fn to_upstream(frame: Frame) -> UpstreamMessage {
    match frame {
        Frame::Text(text) => UpstreamMessage::Text(text.into()),
        Frame::Binary(data) => UpstreamMessage::Binary(data),
        Frame::Close => UpstreamMessage::Close(None),
    }
}

/// Peek at a provider text frame for logging. Never mutates the payload and
/// never rejects it: non-JSON where JSON was expected passes through as-is.
pub fn observe_provider_frame(frame: &Frame, id: ConnectionId) {
    let Frame::Text(text) = frame else { return };
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        trace!(session_id = %id, "Non-JSON provider frame, passing through");
        return;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("session.created") => {
            info!(session_id = %id, "Provider session created");
        }
        Some("error") => {
            let message = value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            warn!(session_id = %id, error = %message, "Provider reported an error");
        }
        _ => {}
    }
}

/// Move frames from `rx` to `tx` until either side goes away.
///
/// Frames are delivered in the exact order received; a close frame ends the
/// pump without being forwarded (the bridge closes both sides itself so
/// teardown stays symmetric).
pub async fn pump<R, W, E>(
    mut rx: R,
    tx: &mut W,
    direction: Direction,
    id: ConnectionId,
) -> PumpEnd
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    W: Sink<Frame> + Unpin,
    E: std::fmt::Display,
    W::Error: std::fmt::Display,
{
    while let Some(item) = rx.next().await {
        let frame = match item {
            Ok(Frame::Close) => {
                debug!(session_id = %id, direction = direction.as_str(), "Peer sent close");
                return PumpEnd::SourceClosed;
            }
            Ok(frame) => frame,
            Err(e) => {
                debug!(session_id = %id, direction = direction.as_str(), error = %e, "Read failed");
                return PumpEnd::SourceError;
            }
        };

        if direction == Direction::UpstreamToClient {
            observe_provider_frame(&frame, id);
        }

        if let Err(e) = tx.send(frame).await {
            debug!(session_id = %id, direction = direction.as_str(), error = %e, "Write failed");
            return PumpEnd::SinkClosed;
        }
    }

    debug!(session_id = %id, direction = direction.as_str(), "Peer stream ended");
    PumpEnd::SourceClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use futures::channel::mpsc;
    use std::convert::Infallible;

    fn test_id() -> ConnectionId {
        SessionRegistry::new().allocate()
    }

    #[tokio::test]
    async fn test_pump_preserves_order() {
        let (mut in_tx, in_rx) = mpsc::channel::<Frame>(8);
        let (mut out_tx, mut out_rx) = mpsc::channel::<Frame>(8);

        for text in ["m1", "m2", "m3"] {
            in_tx.try_send(Frame::Text(text.to_string())).unwrap();
        }
        drop(in_tx);

        let end = pump(
            in_rx.map(Ok::<_, Infallible>),
            &mut out_tx,
            Direction::ClientToUpstream,
            test_id(),
        )
        .await;
        assert_eq!(end, PumpEnd::SourceClosed);
        drop(out_tx);

        let mut received = Vec::new();
        while let Some(frame) = out_rx.next().await {
            received.push(frame);
        }
        assert_eq!(
            received,
            vec![
                Frame::Text("m1".to_string()),
                Frame::Text("m2".to_string()),
                Frame::Text("m3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_pump_stops_on_close_frame_without_forwarding_it() {
        let (mut in_tx, in_rx) = mpsc::channel::<Frame>(8);
        let (mut out_tx, mut out_rx) = mpsc::channel::<Frame>(8);

        in_tx.try_send(Frame::Text("last".to_string())).unwrap();
        in_tx.try_send(Frame::Close).unwrap();
        in_tx.try_send(Frame::Text("never".to_string())).unwrap();

        let end = pump(
            in_rx.map(Ok::<_, Infallible>),
            &mut out_tx,
            Direction::UpstreamToClient,
            test_id(),
        )
        .await;
        assert_eq!(end, PumpEnd::SourceClosed);
        drop(out_tx);

        let mut received = Vec::new();
        while let Some(frame) = out_rx.next().await {
            received.push(frame);
        }
        assert_eq!(received, vec![Frame::Text("last".to_string())]);
    }

    #[tokio::test]
    async fn test_pump_reports_sink_gone() {
        let (mut in_tx, in_rx) = mpsc::channel::<Frame>(8);
        let (mut out_tx, out_rx) = mpsc::channel::<Frame>(8);
        drop(out_rx);

        in_tx.try_send(Frame::Text("m1".to_string())).unwrap();

        let end = pump(
            in_rx.map(Ok::<_, Infallible>),
            &mut out_tx,
            Direction::ClientToUpstream,
            test_id(),
        )
        .await;
        assert_eq!(end, PumpEnd::SinkClosed);
    }

    #[tokio::test]
    async fn test_pump_forwards_binary_unmodified() {
        let (mut in_tx, in_rx) = mpsc::channel::<Frame>(8);
        let (mut out_tx, mut out_rx) = mpsc::channel::<Frame>(8);

        let audio = Bytes::from_static(&[0x00, 0xff, 0x7f, 0x80]);
        in_tx.try_send(Frame::Binary(audio.clone())).unwrap();
        drop(in_tx);

        pump(
            in_rx.map(Ok::<_, Infallible>),
            &mut out_tx,
            Direction::UpstreamToClient,
            test_id(),
        )
        .await;
        drop(out_tx);

        assert_eq!(out_rx.next().await, Some(Frame::Binary(audio)));
    }

    #[test]
    fn test_observe_tolerates_non_json() {
        // Must not panic or alter anything
        let frame = Frame::Text("not json {".to_string());
        observe_provider_frame(&frame, test_id());

        let frame = Frame::Text(r#"{"type":"error","error":{"message":"boom"}}"#.to_string());
        observe_provider_frame(&frame, test_id());

        let frame = Frame::Binary(Bytes::from_static(b"\x01\x02"));
        observe_provider_frame(&frame, test_id());
    }

    #[test]
    fn test_client_message_round_trip() {
        let msg = ClientMessage::Text("hello".into());
        assert_eq!(from_client(msg), Some(Frame::Text("hello".to_string())));
        assert_eq!(from_client(ClientMessage::Ping(Bytes::new())), None);
        assert_eq!(from_client(ClientMessage::Close(None)), Some(Frame::Close));

        match to_client(Frame::Text("hi".to_string())) {
            ClientMessage::Text(text) => assert_eq!(text.as_str(), "hi"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_upstream_message_round_trip() {
        let msg = UpstreamMessage::Text("hello".into());
        assert_eq!(from_upstream(msg), Some(Frame::Text("hello".to_string())));
        assert_eq!(from_upstream(UpstreamMessage::Pong(Bytes::new())), None);

        match to_upstream(Frame::Binary(Bytes::from_static(b"abc"))) {
            UpstreamMessage::Binary(data) => assert_eq!(&data[..], b"abc"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
