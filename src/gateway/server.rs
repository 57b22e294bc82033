//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::failsafe::RateLimiter;
use crate::provider::CredentialIssuer;
use crate::registry::SessionRegistry;
use crate::{Error, Result};

/// Realtime relay server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Session registry
    registry: Arc<SessionRegistry>,
    /// Shutdown flag
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Gateway {
    /// Create a new gateway
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            shutdown_tx: None,
        })
    }

    /// Trigger shutdown without a signal (used by embedding tests)
    pub fn shutdown(&self) {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(());
        }
    }

    /// Run the gateway
    pub async fn run(mut self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        // Create shutdown channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let state = Arc::new(AppState {
            registry: Arc::clone(&self.registry),
            issuer: CredentialIssuer::new(self.config.provider.clone()),
            provider: self.config.provider.clone(),
            relay: self.config.relay.clone(),
            secret_limiter: RateLimiter::new(&self.config.credential.rate_limit),
            shutdown: shutdown_tx.clone(),
        });

        let app = create_router(state);
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("REALTIME RELAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            "  POST http://{}:{}/realtime/client_secret  (ephemeral credentials)",
            self.config.server.host, self.config.server.port
        );
        info!(
            "  GET  ws://{}:{}/realtime-proxy  (provider relay)",
            self.config.server.host, self.config.server.port
        );
        info!(
            "  GET  ws://{}:{}/stream  (diagnostic echo bus)",
            self.config.server.host, self.config.server.port
        );

        if self.config.provider.resolve_api_key().is_some() {
            info!(
                model = %self.config.provider.model,
                upstream = %self.config.provider.realtime_url,
                "Provider credential configured"
            );
        } else {
            warn!(
                "No provider credential resolved - relay sessions and client secrets will be refused"
            );
        }

        if self.config.relay.allowed_origins.is_empty() {
            warn!("No origin allowlist configured - any origin may connect");
        } else {
            info!(origins = ?self.config.relay.allowed_origins, "Origin allowlist active");
        }
        info!("============================================================");

        // Run server with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        // Bridges saw the shutdown broadcast; give stragglers a moment to
        // close both sides and unregister. Slots cover dialing bridges too,
        // not just registered pairs.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.registry.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.registry.in_flight();
        if remaining > 0 {
            warn!(sessions = remaining, "Session pairs still open at exit");
        } else {
            info!("All session pairs closed");
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
