//! Upstream provider integration
//!
//! Two outbound surfaces: the realtime WebSocket endpoint a session bridge
//! dials on behalf of each client, and the session-creation REST endpoint the
//! credential issuer calls to mint ephemeral client secrets.

pub mod secrets;
pub mod upstream;

pub use secrets::{ClientSecretRequest, CredentialIssuer, EphemeralCredential};
pub use upstream::{UpstreamDialer, UpstreamSocket};
