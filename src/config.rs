//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Provider (upstream realtime API) configuration
    pub provider: ProviderConfig,
    /// Relay behavior configuration
    pub relay: RelayConfig,
    /// Ephemeral credential endpoint configuration
    pub credential: CredentialConfig,
}

/// Server listen configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (HTTP and WebSocket share the port)
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Upstream provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Server-side API key. Supports a literal value or `env:VAR_NAME`.
    /// The key never leaves this process; browsers get ephemeral secrets.
    pub api_key: Option<String>,
    /// Realtime WebSocket endpoint
    pub realtime_url: String,
    /// Session-creation REST endpoint (mints client secrets)
    pub sessions_url: String,
    /// Model passed in the upstream connection URL and secret requests
    pub model: String,
    /// Voice declared in the one-time session configuration, if any
    pub voice: Option<String>,
    /// Modalities declared in the one-time session configuration
    pub modalities: Vec<String>,
    /// Name of the provider beta/version header
    pub beta_header_name: String,
    /// Value of the provider beta/version header
    pub beta_header_value: String,
    /// Send a one-time `session.update` frame after the upstream opens,
    /// before any client frames are forwarded
    pub send_session_config: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: Some("env:OPENAI_API_KEY".to_string()),
            realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
            sessions_url: "https://api.openai.com/v1/realtime/sessions".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            voice: None,
            modalities: vec!["audio".to_string(), "text".to_string()],
            beta_header_name: "OpenAI-Beta".to_string(),
            beta_header_value: "realtime=v1".to_string(),
            send_session_config: true,
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key (expand `env:VAR` indirection).
    ///
    /// Returns `None` when no key is configured or the referenced environment
    /// variable is unset/empty — callers treat that as a configuration error.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        let raw = self.api_key.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(var_name) = raw.strip_prefix("env:") {
            return env::var(var_name).ok().filter(|v| !v.trim().is_empty());
        }
        Some(raw.to_string())
    }
}

/// Policy applied when the upstream connection drops while a session is live.
///
/// In-place reconnection is deliberately not offered: a client connection is
/// bound to at most one upstream connection over its life, so recovery is
/// always client-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamDropPolicy {
    /// Close the client socket without an extra frame
    #[default]
    Close,
    /// Send `{type:"error", error:{...}, retryable:true}` before closing,
    /// inviting the client to reconnect
    NotifyRetryable,
}

/// Relay behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bound on the upstream dial
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// Client frames buffered while the upstream dial is in flight.
    /// Overflow aborts the session rather than growing without bound.
    pub dial_queue: usize,
    /// Maximum WebSocket message size accepted on either side
    pub max_frame_bytes: usize,
    /// Maximum concurrent relay sessions, counted from accept (sessions
    /// still dialing upstream included)
    pub max_sessions: usize,
    /// Allowed `Origin` values for upgrade requests. Empty allows all
    /// (logged as a warning at startup).
    pub allowed_origins: Vec<String>,
    /// What the client sees when the upstream drops mid-session
    pub on_upstream_drop: UpstreamDropPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            dial_queue: 64,
            max_frame_bytes: 16 * 1024 * 1024,
            max_sessions: 256,
            allowed_origins: Vec::new(),
            on_upstream_drop: UpstreamDropPolicy::Close,
        }
    }
}

/// Ephemeral credential endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CredentialConfig {
    /// Rate limit for `POST /realtime/client_secret`
    pub rate_limit: RateLimitConfig,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Burst size
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 5,
            burst_size: 10,
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file layered with
    /// `RELAY_`-prefixed environment variables (`RELAY_SERVER__PORT=9000`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        } else {
            // Default file is optional
            figment = figment.merge(Yaml::file("relay.yaml"));
        }

        let config: Self = figment
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()
            .map_err(|e| Error::Config(format!("Failed to load config: {e}")))?;

        config.load_env_files();
        config.validate()?;
        Ok(config)
    }

    /// Load configured env files into the process environment.
    /// Missing files are skipped; later files override earlier ones.
    pub fn load_env_files(&self) {
        for path in &self.env_files {
            let expanded = expand_tilde(path);
            match dotenvy::from_path_override(&expanded) {
                Ok(()) => tracing::debug!(path = %expanded, "Loaded env file"),
                Err(e) => tracing::debug!(path = %expanded, error = %e, "Skipped env file"),
            }
        }
    }

    /// Validate the parts that would otherwise fail at first use
    pub fn validate(&self) -> Result<()> {
        let realtime = Url::parse(&self.provider.realtime_url)
            .map_err(|e| Error::Config(format!("Invalid realtime_url: {e}")))?;
        if !matches!(realtime.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "realtime_url must be ws:// or wss://, got {}",
                realtime.scheme()
            )));
        }

        Url::parse(&self.provider.sessions_url)
            .map_err(|e| Error::Config(format!("Invalid sessions_url: {e}")))?;

        if self.relay.dial_timeout.is_zero() {
            return Err(Error::Config("relay.dial_timeout must be non-zero".into()));
        }
        if self.relay.dial_queue == 0 {
            return Err(Error::Config("relay.dial_queue must be non-zero".into()));
        }
        if self.relay.max_frame_bytes == 0 {
            return Err(Error::Config("relay.max_frame_bytes must be non-zero".into()));
        }

        Ok(())
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
