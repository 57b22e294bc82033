//! Realtime Relay
//!
//! Bridges browser WebSocket sessions to a streaming AI provider while the
//! long-lived provider key stays server-side.
//!
//! # Features
//!
//! - **Session Bridge**: explicit per-connection state machine pairing each
//!   client socket with exactly one upstream provider socket
//! - **Message Forwarder**: byte-transparent, order-preserving relay in both
//!   directions
//! - **Ephemeral Credentials**: `POST /realtime/client_secret` mints
//!   short-lived secrets so browsers never see the real key
//! - **Diagnostic Bus**: `/stream` echo endpoint for connectivity checks
//! - **Production Ready**: bounded dial timeout, origin screening, session
//!   caps, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod provider;
pub mod registry;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
