//! HTTP router and handlers
//!
//! The connection gateway: owns the route table, screens upgrade requests,
//! and hands accepted relay clients to a session bridge. Unrecognized paths
//! fall through to axum's 404.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use super::{bridge::Bridge, bus};
use crate::config::{ProviderConfig, RelayConfig};
use crate::failsafe::RateLimiter;
use crate::provider::{ClientSecretRequest, CredentialIssuer};
use crate::registry::SessionRegistry;
use crate::Error;

/// Shared application state
pub struct AppState {
    /// Session registry
    pub registry: Arc<SessionRegistry>,
    /// Ephemeral credential issuer
    pub issuer: CredentialIssuer,
    /// Provider configuration (bridges clone from here)
    pub provider: ProviderConfig,
    /// Relay behavior configuration
    pub relay: RelayConfig,
    /// Credential endpoint throttle
    pub secret_limiter: RateLimiter,
    /// Shutdown broadcast; every bridge subscribes
    pub shutdown: broadcast::Sender<()>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.relay.allowed_origins);

    Router::new()
        .route("/health", get(health_handler))
        .route("/realtime/client_secret", post(client_secret_handler))
        .route("/stream", get(stream_handler))
        .route("/realtime-proxy", get(realtime_proxy_handler))
        .layer(CatchPanicLayer::new())
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the credential endpoint. An empty allowlist mirrors the upgrade
/// screening: any origin passes.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Reject upgrade requests from origins outside the allowlist.
/// An empty allowlist admits everything (warned about at startup).
fn screen_origin(allowed: &[String], headers: &HeaderMap) -> Result<(), Response> {
    if allowed.is_empty() {
        return Ok(());
    }
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    match origin {
        Some(origin) if allowed.iter().any(|allowed| allowed == origin) => Ok(()),
        other => {
            warn!(origin = ?other, "Rejected upgrade from disallowed origin");
            Err((
                StatusCode::FORBIDDEN,
                Json(json!({"error": "origin not allowed"})),
            )
                .into_response())
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.active(),
    }))
}

/// POST /realtime/client_secret
///
/// Body is optional; malformed JSON is a client error rather than being
/// silently ignored.
async fn client_secret_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    if !state.secret_limiter.try_acquire() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate limit exceeded"})),
        )
            .into_response();
    }

    let request: ClientSecretRequest = if body.is_empty() {
        ClientSecretRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid request body", "details": e.to_string()})),
                )
                    .into_response();
            }
        }
    };

    match state.issuer.issue(&request).await {
        Ok(credential) => (StatusCode::OK, Json(credential)).into_response(),
        Err(e) => issue_error_response(&e),
    }
}

/// Map issuer failures to HTTP per the error taxonomy: configuration errors
/// are ours, provider rejections keep the provider's status and body,
/// network failures are a bad gateway.
fn issue_error_response(error: &Error) -> Response {
    match error {
        Error::Config(message) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": message})),
        )
            .into_response(),
        Error::UpstreamRejected { status, body } => {
            let status =
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            let details: Value = serde_json::from_str(body)
                .unwrap_or_else(|_| Value::String(body.clone()));
            (
                status,
                Json(json!({"error": "provider rejected request", "details": details})),
            )
                .into_response()
        }
        Error::Http(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "provider unreachable", "details": e.to_string()})),
        )
            .into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": other.to_string()})),
        )
            .into_response(),
    }
}

/// GET /stream (upgrade) — diagnostic echo bus
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(response) = screen_origin(&state.relay.allowed_origins, &headers) {
        return response;
    }
    let id = state.registry.allocate();
    let shutdown = state.shutdown.subscribe();
    ws.max_message_size(state.relay.max_frame_bytes)
        .on_upgrade(move |socket| bus::run(socket, id, shutdown))
}

/// GET /realtime-proxy (upgrade) — provider relay
async fn realtime_proxy_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(response) = screen_origin(&state.relay.allowed_origins, &headers) {
        return response;
    }

    let id = state.registry.allocate();
    let shutdown = state.shutdown.subscribe();
    let state = Arc::clone(&state);

    // The slot is taken once the socket exists (an upgrade that never
    // completes must not consume one) and held until the bridge finishes,
    // so sessions still dialing upstream count against the cap.
    ws.max_message_size(state.relay.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            if !state.registry.try_reserve(state.relay.max_sessions) {
                warn!(session_id = %id, "Refusing session: relay at capacity");
                refuse_over_capacity(socket).await;
                return;
            }
            Bridge::new(
                id,
                Arc::clone(&state.registry),
                state.provider.clone(),
                state.relay.clone(),
                shutdown,
            )
            .run(socket)
            .await;
        })
}

/// Session cap reached: tell the client why before closing
async fn refuse_over_capacity(mut socket: WebSocket) {
    let frame = json!({"type": "error", "error": {"message": "relay at capacity"}}).to_string();
    let _ = socket
        .send(axum::extract::ws::Message::Text(frame.into()))
        .await;
    let _ = socket.send(axum::extract::ws::Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialConfig, ProviderConfig, RelayConfig};
    use axum::body::to_bytes;

    fn test_state() -> Arc<AppState> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(AppState {
            registry: Arc::new(SessionRegistry::new()),
            issuer: CredentialIssuer::new(ProviderConfig::default()),
            provider: ProviderConfig::default(),
            relay: RelayConfig::default(),
            secret_limiter: RateLimiter::new(&CredentialConfig::default().rate_limit),
            shutdown,
        })
    }

    fn headers_with_origin(origin: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(origin) = origin {
            headers.insert(header::ORIGIN, origin.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_screen_origin_empty_allowlist_admits_all() {
        assert!(screen_origin(&[], &headers_with_origin(None)).is_ok());
        assert!(screen_origin(&[], &headers_with_origin(Some("https://evil.example"))).is_ok());
    }

    #[test]
    fn test_screen_origin_enforces_allowlist() {
        let allowed = vec!["https://dashboard.example.com".to_string()];
        assert!(
            screen_origin(
                &allowed,
                &headers_with_origin(Some("https://dashboard.example.com"))
            )
            .is_ok()
        );

        let rejected =
            screen_origin(&allowed, &headers_with_origin(Some("https://evil.example")));
        assert_eq!(rejected.unwrap_err().status(), StatusCode::FORBIDDEN);

        // Missing Origin with an allowlist configured is also rejected
        let rejected = screen_origin(&allowed, &headers_with_origin(None));
        assert_eq!(rejected.unwrap_err().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_health_reports_session_count() {
        let state = test_state();
        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["sessions"], 0);
    }

    #[tokio::test]
    async fn test_client_secret_without_key_is_config_error() {
        let (shutdown, _) = broadcast::channel(1);
        let provider = ProviderConfig {
            api_key: None,
            // Unroutable: any attempt to call the provider would fail loudly
            sessions_url: "http://127.0.0.1:1/v1/realtime/sessions".to_string(),
            ..Default::default()
        };
        let state = Arc::new(AppState {
            registry: Arc::new(SessionRegistry::new()),
            issuer: CredentialIssuer::new(provider.clone()),
            provider,
            relay: RelayConfig::default(),
            secret_limiter: RateLimiter::new(&CredentialConfig::default().rate_limit),
            shutdown,
        });

        let response = client_secret_handler(State(state), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert!(value["error"].as_str().unwrap().contains("API key"));
    }

    #[tokio::test]
    async fn test_client_secret_rejects_malformed_body() {
        let state = test_state();
        let response =
            client_secret_handler(State(state), Bytes::from_static(b"{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_issue_error_response_propagates_provider_status() {
        let error = Error::UpstreamRejected {
            status: 401,
            body: r#"{"error": {"message": "bad key"}}"#.to_string(),
        };
        let response = issue_error_response(&error);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_issue_error_response_network_is_bad_gateway() {
        // reqwest errors can't be constructed directly; the Internal fallback
        // and Config mapping cover the remaining taxonomy here.
        let response = issue_error_response(&Error::Config("no key".to_string()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = issue_error_response(&Error::Internal("boom".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
