//! Ephemeral credential issuer
//!
//! Exchanges the long-lived server-side key for a short-lived client secret
//! via the provider's session-creation REST endpoint. Only the secret and its
//! expiry reach the caller; nothing is stored server-side and the credential
//! is not tied to any session pair.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::{Error, Result};

/// Optional parameters accepted by `POST /realtime/client_secret`.
/// Anything absent falls back to the configured provider defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSecretRequest {
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
    /// Voice override
    #[serde(default)]
    pub voice: Option<String>,
    /// Modalities override
    #[serde(default)]
    pub modalities: Option<Vec<String>>,
}

/// A minted short-lived secret, as returned to the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralCredential {
    /// The short-lived client secret
    pub client_secret: String,
    /// Unix timestamp (seconds) when the secret expires
    pub expires_at: i64,
}

/// Issues ephemeral credentials against the provider's REST endpoint
pub struct CredentialIssuer {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl CredentialIssuer {
    /// Create an issuer for the given provider configuration
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Session-creation request body, with per-request overrides applied
    fn request_body(&self, request: &ClientSecretRequest) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.config.model),
            "modalities": request
                .modalities
                .as_ref()
                .unwrap_or(&self.config.modalities),
        });
        if let Some(voice) = request.voice.as_deref().or(self.config.voice.as_deref()) {
            body["voice"] = json!(voice);
        }
        body
    }

    /// Mint a client secret.
    ///
    /// Fails fast with [`Error::Config`] when no server-side key resolves —
    /// the provider is never called in that case. Provider non-2xx responses
    /// surface as [`Error::UpstreamRejected`] with the status and body intact.
    pub async fn issue(&self, request: &ClientSecretRequest) -> Result<EphemeralCredential> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| Error::Config("no provider API key configured".to_string()))?;

        let response = self
            .http
            .post(&self.config.sessions_url)
            .bearer_auth(api_key)
            .json(&self.request_body(request))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::UpstreamRejected {
                status: status.as_u16(),
                body,
            });
        }

        let credential = parse_credential(&body)?;
        debug!(expires_at = credential.expires_at, "Issued ephemeral credential");
        Ok(credential)
    }
}

/// Extract `{client_secret, expires_at}` from a provider session response.
///
/// Accepts both the nested shape `{"client_secret": {"value": ..,
/// "expires_at": ..}}` and the flat `{"client_secret": .., "expires_at": ..}`.
pub fn parse_credential(body: &str) -> Result<EphemeralCredential> {
    let value: Value = serde_json::from_str(body)?;

    let (secret, expires_at) = match value.get("client_secret") {
        Some(Value::Object(nested)) => (
            nested.get("value").and_then(Value::as_str),
            nested.get("expires_at").and_then(Value::as_i64),
        ),
        Some(Value::String(secret)) => (
            Some(secret.as_str()),
            value.get("expires_at").and_then(Value::as_i64),
        ),
        _ => (None, None),
    };

    let client_secret = secret
        .ok_or_else(|| Error::Internal("provider response missing client_secret".to_string()))?
        .to_string();
    let expires_at = expires_at
        .ok_or_else(|| Error::Internal("provider response missing expires_at".to_string()))?;

    Ok(EphemeralCredential {
        client_secret,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_nested_shape() {
        let body = r#"{
            "id": "sess_123",
            "client_secret": {"value": "ek_abc", "expires_at": 1735689600}
        }"#;
        let credential = parse_credential(body).unwrap();
        assert_eq!(credential.client_secret, "ek_abc");
        assert_eq!(credential.expires_at, 1_735_689_600);
    }

    #[test]
    fn test_parse_flat_shape() {
        let body = r#"{"client_secret": "ek_flat", "expires_at": 42}"#;
        let credential = parse_credential(body).unwrap();
        assert_eq!(credential.client_secret, "ek_flat");
        assert_eq!(credential.expires_at, 42);
    }

    #[test]
    fn test_parse_missing_secret() {
        let err = parse_credential(r#"{"id": "sess_123"}"#).unwrap_err();
        assert!(err.to_string().contains("client_secret"));
    }

    #[test]
    fn test_parse_missing_expiry() {
        let err = parse_credential(r#"{"client_secret": "ek_abc"}"#).unwrap_err();
        assert!(err.to_string().contains("expires_at"));
    }

    #[test]
    fn test_parse_non_json() {
        assert!(matches!(
            parse_credential("<html>oops</html>"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_request_body_defaults_and_overrides() {
        let config = ProviderConfig {
            voice: Some("verse".to_string()),
            ..Default::default()
        };
        let issuer = CredentialIssuer::new(config);

        let body = issuer.request_body(&ClientSecretRequest::default());
        assert_eq!(body["model"], "gpt-4o-realtime-preview");
        assert_eq!(body["voice"], "verse");
        assert_eq!(body["modalities"][0], "audio");

        let body = issuer.request_body(&ClientSecretRequest {
            model: Some("gpt-4o-mini-realtime-preview".to_string()),
            voice: Some("alloy".to_string()),
            modalities: Some(vec!["text".to_string()]),
        });
        assert_eq!(body["model"], "gpt-4o-mini-realtime-preview");
        assert_eq!(body["voice"], "alloy");
        assert_eq!(body["modalities"], json!(["text"]));
    }

    #[tokio::test]
    async fn test_issue_without_key_never_calls_provider() {
        // The sessions_url is unroutable; reaching it would error differently
        // than the expected configuration failure.
        let config = ProviderConfig {
            api_key: None,
            sessions_url: "http://127.0.0.1:1/v1/realtime/sessions".to_string(),
            ..Default::default()
        };
        let issuer = CredentialIssuer::new(config);
        let err = issuer.issue(&ClientSecretRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
