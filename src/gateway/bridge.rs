//! Session bridge
//!
//! One bridge task per accepted client connection. The bridge owns both
//! sockets of a session pair: it dials the upstream provider, registers the
//! pair, wires the forwarder pumps, and tears both sides down together. The
//! lifecycle is an explicit state machine (`step`) rather than callback
//! wiring, so every transition and its side effects can be tested in
//! isolation from the sockets.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use chrono::Utc;
use futures::{SinkExt, StreamExt, future};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::forwarder::{self, Direction, Frame, PumpEnd};
use crate::config::{ProviderConfig, RelayConfig, UpstreamDropPolicy};
use crate::provider::upstream::UpstreamDialer;
use crate::registry::{ConnectionId, SessionEntry, SessionRegistry};

// ── State machine ──────────────────────────────────────────────────────────

/// Lifecycle states of a session bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Client upgrade completed
    Accepted,
    /// Opening the upstream connection with provider credentials
    DialingUpstream,
    /// Upstream open, forwarder active in both directions
    Ready,
    /// Either side signaled close or error; tearing down the other side
    Closing,
    /// Both sockets closed, registry entry removed
    Closed,
}

/// Events driving the bridge state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    /// No server-side credential is configured
    CredentialMissing,
    /// A credential resolved; dialing may begin
    CredentialPresent,
    /// Upstream connection reports open
    UpstreamOpen,
    /// Upstream dial failed (network error, auth rejection, or timeout)
    DialFailed,
    /// Registering the pair failed (duplicate connection id)
    RegisterFailed,
    /// Client frames overflowed the dial-time queue
    QueueOverflow,
    /// Client socket closed or errored
    ClientGone,
    /// Upstream socket closed or errored
    UpstreamGone,
    /// Process shutdown requested
    Shutdown,
    /// Both sockets confirmed down
    TeardownComplete,
}

/// Side effects a transition asks the driver to perform, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open the upstream connection
    DialUpstream,
    /// Drop an in-flight dial
    AbandonDial,
    /// Record the pair in the session registry
    RegisterPair,
    /// Send the one-time session configuration frame upstream
    SendSessionConfig,
    /// Send the synthetic ready frame to the client
    NotifyClientReady,
    /// Send an error frame to the client
    NotifyClientError,
    /// Send the configured upstream-drop frame to the client
    NotifyUpstreamDrop,
    /// Start the forwarder pumps
    StartForwarding,
    /// Close the client socket
    CloseClient,
    /// Close the upstream socket
    CloseUpstream,
    /// Remove the registry entry
    Unregister,
}

/// Advance the state machine. Pure: the caller performs the returned actions.
///
/// `Closing` absorbs further close/error events (closing an already-closing
/// session is a no-op) and `Closed` absorbs everything.
#[must_use]
pub fn step(state: BridgeState, event: BridgeEvent) -> (BridgeState, Vec<Action>) {
    use Action as A;
    use BridgeEvent as E;
    use BridgeState as S;

    match (state, event) {
        (S::Accepted, E::CredentialMissing) => {
            (S::Closing, vec![A::NotifyClientError, A::CloseClient])
        }
        (S::Accepted, E::CredentialPresent) => (S::DialingUpstream, vec![A::DialUpstream]),
        (S::Accepted, E::ClientGone | E::Shutdown) => (S::Closing, vec![A::CloseClient]),

        (S::DialingUpstream, E::UpstreamOpen) => (
            S::Ready,
            vec![
                A::RegisterPair,
                A::SendSessionConfig,
                A::NotifyClientReady,
                A::StartForwarding,
            ],
        ),
        (S::DialingUpstream, E::DialFailed) => {
            (S::Closing, vec![A::NotifyClientError, A::CloseClient])
        }
        (S::DialingUpstream, E::ClientGone) => (S::Closing, vec![A::AbandonDial, A::CloseClient]),
        (S::DialingUpstream, E::QueueOverflow) => (
            S::Closing,
            vec![A::AbandonDial, A::NotifyClientError, A::CloseClient],
        ),
        (S::DialingUpstream, E::Shutdown) => (S::Closing, vec![A::AbandonDial, A::CloseClient]),

        (S::Ready, E::RegisterFailed) => (
            S::Closing,
            vec![A::NotifyClientError, A::CloseClient, A::CloseUpstream],
        ),
        (S::Ready, E::ClientGone) => (S::Closing, vec![A::CloseUpstream]),
        (S::Ready, E::UpstreamGone) => {
            (S::Closing, vec![A::NotifyUpstreamDrop, A::CloseClient])
        }
        (S::Ready, E::Shutdown) => (S::Closing, vec![A::CloseClient, A::CloseUpstream]),

        (S::Closing, E::TeardownComplete) => (S::Closed, vec![A::Unregister]),
        (S::Closing, _) => (S::Closing, vec![]),
        (S::Closed, _) => (S::Closed, vec![]),

        // Everything else cannot happen from a correctly driven bridge;
        // treat it as an immediate close rather than panicking.
        (_, _) => (S::Closing, vec![A::CloseClient, A::CloseUpstream]),
    }
}

// ── Frames ─────────────────────────────────────────────────────────────────

/// Synthetic frame telling the client the pair is ready
fn proxy_connected_frame() -> String {
    json!({"type": "proxy.connected"}).to_string()
}

/// Error frame sent to the client before close
fn error_frame(message: &str, retryable: bool) -> String {
    let mut frame = json!({"type": "error", "error": {"message": message}});
    if retryable {
        frame["retryable"] = json!(true);
    }
    frame.to_string()
}

/// One-time session configuration sent upstream before any client frames
fn session_config_frame(provider: &ProviderConfig) -> String {
    let mut session = serde_json::Map::new();
    session.insert("modalities".to_string(), json!(provider.modalities));
    if let Some(voice) = &provider.voice {
        session.insert("voice".to_string(), json!(voice));
    }
    json!({"type": "session.update", "session": session}).to_string()
}

// ── Driver ─────────────────────────────────────────────────────────────────

/// How the forwarding phase ended
enum SessionEnd {
    ClientGone,
    UpstreamGone,
    Shutdown,
}

/// Per-connection bridge driver
pub struct Bridge {
    id: ConnectionId,
    state: BridgeState,
    registry: Arc<SessionRegistry>,
    provider: ProviderConfig,
    relay: RelayConfig,
    shutdown: broadcast::Receiver<()>,
}

impl Bridge {
    /// Create a bridge for a freshly accepted client connection
    pub fn new(
        id: ConnectionId,
        registry: Arc<SessionRegistry>,
        provider: ProviderConfig,
        relay: RelayConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            state: BridgeState::Accepted,
            registry,
            provider,
            relay,
            shutdown,
        }
    }

    /// Advance the machine, logging the transition
    fn apply(&mut self, event: BridgeEvent) -> Vec<Action> {
        let (next, actions) = step(self.state, event);
        if next != self.state {
            debug!(
                session_id = %self.id,
                from = ?self.state,
                to = ?next,
                event = ?event,
                "Bridge transition"
            );
        }
        self.state = next;
        actions
    }

    /// Finish teardown: mark closed, drop the registry entry, give back the
    /// session slot taken at accept. Every exit path of [`run`](Self::run)
    /// ends here exactly once.
    fn finish(&mut self) {
        for action in self.apply(BridgeEvent::TeardownComplete) {
            if action == Action::Unregister {
                self.registry.unregister(self.id);
            }
        }
        self.registry.release();
        debug!(session_id = %self.id, "Bridge closed");
    }

    /// Run the bridge to completion. Consumes the client socket; both sides
    /// are closed by the time this returns.
    pub async fn run(mut self, mut client: WebSocket) {
        // Accepted: a dial is attempted iff a credential is configured
        let Some(api_key) = self.provider.resolve_api_key() else {
            warn!(session_id = %self.id, "No provider credential configured, refusing session");
            for action in self.apply(BridgeEvent::CredentialMissing) {
                match action {
                    Action::NotifyClientError => {
                        let frame = error_frame("relay has no provider credential configured", false);
                        let _ = client.send(forwarder::to_client(Frame::Text(frame))).await;
                    }
                    Action::CloseClient => {
                        let _ = client.send(forwarder::to_client(Frame::Close)).await;
                    }
                    _ => {}
                }
            }
            self.finish();
            return;
        };

        self.apply(BridgeEvent::CredentialPresent);
        let dialer = UpstreamDialer::new(self.provider.clone(), self.relay.max_frame_bytes);
        let dial = tokio::time::timeout(self.relay.dial_timeout, dialer.dial(&api_key));
        tokio::pin!(dial);

        // Client frames arriving mid-dial are queued (bounded) and flushed
        // after the session configuration, preserving order.
        let mut pending: Vec<Frame> = Vec::new();

        let mut upstream = loop {
            tokio::select! {
                result = &mut dial => {
                    match result {
                        Ok(Ok(socket)) => break socket,
                        Ok(Err(e)) => {
                            warn!(session_id = %self.id, error = %e, "Upstream dial failed");
                            self.fail_dial(&mut client, &e.to_string()).await;
                            return;
                        }
                        Err(_) => {
                            warn!(
                                session_id = %self.id,
                                timeout = ?self.relay.dial_timeout,
                                "Upstream dial timed out"
                            );
                            self.fail_dial(&mut client, "upstream dial timed out").await;
                            return;
                        }
                    }
                }
                message = client.recv() => {
                    match message {
                        Some(Ok(msg)) => match forwarder::from_client(msg) {
                            Some(Frame::Close) => {
                                debug!(session_id = %self.id, "Client closed during dial");
                                self.apply(BridgeEvent::ClientGone);
                                self.finish();
                                return;
                            }
                            Some(frame) => {
                                if pending.len() >= self.relay.dial_queue {
                                    warn!(session_id = %self.id, "Dial-time frame queue overflow");
                                    for action in self.apply(BridgeEvent::QueueOverflow) {
                                        if action == Action::NotifyClientError {
                                            let frame = error_frame(
                                                "too many frames queued while connecting upstream",
                                                false,
                                            );
                                            let _ = client
                                                .send(forwarder::to_client(Frame::Text(frame)))
                                                .await;
                                        }
                                    }
                                    let _ = client.send(forwarder::to_client(Frame::Close)).await;
                                    self.finish();
                                    return;
                                }
                                pending.push(frame);
                            }
                            None => {}
                        },
                        Some(Err(_)) | None => {
                            debug!(session_id = %self.id, "Client went away during dial");
                            self.apply(BridgeEvent::ClientGone);
                            self.finish();
                            return;
                        }
                    }
                }
                _ = self.shutdown.recv() => {
                    debug!(session_id = %self.id, "Shutdown during dial");
                    self.apply(BridgeEvent::Shutdown);
                    let _ = client.send(forwarder::to_client(Frame::Close)).await;
                    self.finish();
                    return;
                }
            }
        };

        // Ready
        let ready_actions = self.apply(BridgeEvent::UpstreamOpen);
        debug_assert!(ready_actions.contains(&Action::RegisterPair));

        let entry = SessionEntry {
            endpoint: "/realtime-proxy",
            model: self.provider.model.clone(),
            established_at: Utc::now(),
        };
        if let Err(e) = self.registry.register(self.id, entry) {
            warn!(session_id = %self.id, error = %e, "Session registration failed");
            self.apply(BridgeEvent::RegisterFailed);
            let frame = error_frame("session registration conflict", false);
            let _ = client.send(forwarder::to_client(Frame::Text(frame))).await;
            let _ = client.send(forwarder::to_client(Frame::Close)).await;
            let _ = upstream.close(None).await;
            self.finish();
            return;
        }

        let (up_sink, up_stream) = upstream.split();
        let (client_sink, client_stream) = client.split();

        let mut up_tx = up_sink.with(|frame: Frame| {
            future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(
                forwarder::to_upstream(frame),
            ))
        });
        let mut client_tx = client_sink
            .with(|frame: Frame| future::ready(Ok::<_, axum::Error>(forwarder::to_client(frame))));

        // Provider-specific initialization goes out before anything the
        // client queued during the dial.
        if ready_actions.contains(&Action::SendSessionConfig) && self.provider.send_session_config {
            let config = session_config_frame(&self.provider);
            if up_tx.send(Frame::Text(config)).await.is_err() {
                self.close_after_upstream_drop(&mut client_tx).await;
                return;
            }
        }

        let ready = proxy_connected_frame();
        if client_tx.send(Frame::Text(ready)).await.is_err() {
            self.apply(BridgeEvent::ClientGone);
            let _ = up_tx.send(Frame::Close).await;
            self.finish();
            return;
        }

        for frame in pending.drain(..) {
            if up_tx.send(frame).await.is_err() {
                self.close_after_upstream_drop(&mut client_tx).await;
                return;
            }
        }

        info!(session_id = %self.id, model = %self.provider.model, "Session pair ready");

        // Forwarding: both pumps run until either side goes away
        let end = {
            let client_rx = client_stream.filter_map(|result| {
                future::ready(match result {
                    Ok(msg) => forwarder::from_client(msg).map(Ok),
                    Err(e) => Some(Err(e)),
                })
            });
            let up_rx = up_stream.filter_map(|result| {
                future::ready(match result {
                    Ok(msg) => forwarder::from_upstream(msg).map(Ok),
                    Err(e) => Some(Err(e)),
                })
            });

            let c2u = forwarder::pump(client_rx, &mut up_tx, Direction::ClientToUpstream, self.id);
            let u2c = forwarder::pump(up_rx, &mut client_tx, Direction::UpstreamToClient, self.id);
            tokio::pin!(c2u, u2c);

            tokio::select! {
                end = &mut c2u => match end {
                    PumpEnd::SinkClosed => SessionEnd::UpstreamGone,
                    PumpEnd::SourceClosed | PumpEnd::SourceError => SessionEnd::ClientGone,
                },
                end = &mut u2c => match end {
                    PumpEnd::SinkClosed => SessionEnd::ClientGone,
                    PumpEnd::SourceClosed | PumpEnd::SourceError => SessionEnd::UpstreamGone,
                },
                _ = self.shutdown.recv() => SessionEnd::Shutdown,
            }
        };

        match end {
            SessionEnd::ClientGone => {
                info!(session_id = %self.id, "Client disconnected, closing upstream");
                for action in self.apply(BridgeEvent::ClientGone) {
                    if action == Action::CloseUpstream {
                        let _ = up_tx.send(Frame::Close).await;
                    }
                }
                self.finish();
            }
            SessionEnd::UpstreamGone => {
                self.close_after_upstream_drop(&mut client_tx).await;
            }
            SessionEnd::Shutdown => {
                info!(session_id = %self.id, "Shutdown, closing session pair");
                for action in self.apply(BridgeEvent::Shutdown) {
                    match action {
                        Action::CloseClient => {
                            let _ = client_tx.send(Frame::Close).await;
                        }
                        Action::CloseUpstream => {
                            let _ = up_tx.send(Frame::Close).await;
                        }
                        _ => {}
                    }
                }
                self.finish();
            }
        }
    }

    /// Dial failure: forward an error frame to the client, then close
    async fn fail_dial(&mut self, client: &mut WebSocket, reason: &str) {
        for action in self.apply(BridgeEvent::DialFailed) {
            match action {
                Action::NotifyClientError => {
                    let frame = error_frame(&format!("upstream connection failed: {reason}"), false);
                    let _ = client.send(forwarder::to_client(Frame::Text(frame))).await;
                }
                Action::CloseClient => {
                    let _ = client.send(forwarder::to_client(Frame::Close)).await;
                }
                _ => {}
            }
        }
        self.finish();
    }

    /// Upstream dropped on a live pair: apply the configured policy, close
    /// the client, unregister.
    async fn close_after_upstream_drop<W>(&mut self, client_tx: &mut W)
    where
        W: futures::Sink<Frame> + Unpin,
    {
        info!(session_id = %self.id, "Upstream closed, closing client");
        for action in self.apply(BridgeEvent::UpstreamGone) {
            match action {
                Action::NotifyUpstreamDrop => {
                    if self.relay.on_upstream_drop == UpstreamDropPolicy::NotifyRetryable {
                        let frame = error_frame("upstream connection closed", true);
                        let _ = client_tx.send(Frame::Text(frame)).await;
                    }
                }
                Action::CloseClient => {
                    let _ = client_tx.send(Frame::Close).await;
                }
                _ => {}
            }
        }
        self.finish();
    }
}
