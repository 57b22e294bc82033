//! Upstream WebSocket dial
//!
//! Opens the provider realtime connection with the server-side key in an
//! `Authorization: Bearer` header plus the provider's beta/version header.
//! Model selection rides in the connection URL; further session parameters go
//! out in the bridge's one-time configuration frame.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::debug;
use url::Url;

use crate::config::ProviderConfig;
use crate::{Error, Result};

/// A live connection to the provider's realtime endpoint
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens upstream connections for session bridges
pub struct UpstreamDialer {
    config: ProviderConfig,
    max_frame_bytes: usize,
}

impl UpstreamDialer {
    /// Create a dialer for the given provider configuration
    #[must_use]
    pub fn new(config: ProviderConfig, max_frame_bytes: usize) -> Self {
        Self {
            config,
            max_frame_bytes,
        }
    }

    /// Build the handshake request: URL with model query, auth and beta headers
    pub fn request(&self, api_key: &str) -> Result<Request> {
        let mut url = Url::parse(&self.config.realtime_url)
            .map_err(|e| Error::Config(format!("Invalid realtime_url: {e}")))?;
        url.query_pairs_mut().append_pair("model", &self.config.model);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::UpstreamDial(e.to_string()))?;

        let headers = request.headers_mut();
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| Error::Config(format!("API key is not a valid header value: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        if !self.config.beta_header_name.is_empty() {
            let name = HeaderName::from_bytes(self.config.beta_header_name.as_bytes())
                .map_err(|e| Error::Config(format!("Invalid beta header name: {e}")))?;
            let value = HeaderValue::from_str(&self.config.beta_header_value)
                .map_err(|e| Error::Config(format!("Invalid beta header value: {e}")))?;
            headers.insert(name, value);
        }

        Ok(request)
    }

    /// Dial the provider. The caller bounds this with its dial timeout.
    pub async fn dial(&self, api_key: &str) -> Result<UpstreamSocket> {
        let request = self.request(api_key)?;
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_bytes))
            .max_frame_size(Some(self.max_frame_bytes));

        let (socket, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(response) => {
                    let body = response
                        .body()
                        .as_ref()
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default();
                    Error::UpstreamRejected {
                        status: response.status().as_u16(),
                        body,
                    }
                }
                other => Error::UpstreamDial(other.to_string()),
            })?;

        debug!(status = %response.status(), "Upstream WebSocket open");
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_model_and_headers() {
        let dialer = UpstreamDialer::new(ProviderConfig::default(), 1024);
        let request = dialer.request("sk-test").unwrap();

        let uri = request.uri().to_string();
        assert!(uri.starts_with("wss://api.openai.com/v1/realtime"));
        assert!(uri.contains("model=gpt-4o-realtime-preview"));

        let auth = request.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer sk-test");

        let beta = request.headers().get("openai-beta").unwrap();
        assert_eq!(beta.to_str().unwrap(), "realtime=v1");
    }

    #[test]
    fn test_request_skips_empty_beta_header() {
        let config = ProviderConfig {
            beta_header_name: String::new(),
            ..Default::default()
        };
        let dialer = UpstreamDialer::new(config, 1024);
        let request = dialer.request("sk-test").unwrap();
        assert!(request.headers().get("openai-beta").is_none());
    }

    #[test]
    fn test_request_rejects_bad_url() {
        let config = ProviderConfig {
            realtime_url: "not a url".to_string(),
            ..Default::default()
        };
        let dialer = UpstreamDialer::new(config, 1024);
        assert!(matches!(
            dialer.request("sk-test"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_request_rejects_key_with_control_chars() {
        let dialer = UpstreamDialer::new(ProviderConfig::default(), 1024);
        assert!(matches!(
            dialer.request("sk-bad\nnewline"),
            Err(Error::Config(_))
        ));
    }
}
