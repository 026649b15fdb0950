//! Protocol message types for the external-connection handshake.
//!
//! Every frame on the wire is a JSON object with an `action` field.  The
//! three inbound authentication actions and the two outbound pushes mirror
//! the handshake described in the runtime's external-connection contract:
//!
//! ```text
//! sponsor → runtime     register-external-connection   {identity?}
//! external → runtime    request-external-authorization {identity?, process_id?}
//! runtime → external    external-authorization-response {file, token, identity}
//! external → runtime    request-authorization          {identity, token}
//! runtime → external    authorization-response         {success, reason?}
//! ```

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

// ── Action names ──────────────────────────────────────────────────────────────

/// Wire-level action name constants.
pub mod actions {
    /// Sponsor pre-authorizes a future external connection.
    pub const REGISTER_EXTERNAL_CONNECTION: &str = "register-external-connection";
    /// External process announces itself and asks for a file challenge.
    pub const REQUEST_EXTERNAL_AUTHORIZATION: &str = "request-external-authorization";
    /// External process presents `{identity, token}` for verification.
    pub const REQUEST_AUTHORIZATION: &str = "request-authorization";

    /// Returns whether `action` is one of the authentication entry points,
    /// which are the only actions admitted from unauthenticated external
    /// connections.
    pub fn is_authentication_action(action: &str) -> bool {
        matches!(
            action,
            REGISTER_EXTERNAL_CONNECTION | REQUEST_EXTERNAL_AUTHORIZATION | REQUEST_AUTHORIZATION
        )
    }
}

// ── Inbound envelope ──────────────────────────────────────────────────────────

/// One parsed inbound frame.
///
/// The payload stays as raw JSON until the dispatcher knows which action it
/// is routing; unknown actions must still carry enough structure for the
/// authentication gate to resolve the sender identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub action: String,
    /// Action-specific payload; `null` when the frame omitted it.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Identity the sending connection claims for itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// Original identity forwarded by a peer runtime relaying this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_identity: Option<Identity>,
}

impl InboundEnvelope {
    pub fn new(action: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            payload,
            identity: None,
            runtime_identity: None,
        }
    }

    /// The identity to authenticate against: a forwarded identity from a
    /// peer runtime takes precedence over the connection-local one.
    pub fn resolved_identity(&self) -> Option<Identity> {
        self.runtime_identity.or(self.identity)
    }

    /// Deserializes the payload into the typed request for this action.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the payload does not match the
    /// expected shape.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ── Typed request payloads ────────────────────────────────────────────────────

/// Payload of `register-external-connection` (sponsored flow).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterExternalConnectionRequest {
    /// Identity the sponsor wants assigned; freshly generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

/// Payload of `request-external-authorization` (file-challenge flow).
///
/// Carried verbatim inside the pending record; the metadata fields feed the
/// post-authentication license report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalAuthRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// OS process id of the requester, used for identity resolution via the
    /// process tracker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

/// Payload of `request-authorization` (verification).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub identity: Identity,
    pub token: String,
}

// ── Outbound envelope ─────────────────────────────────────────────────────────

/// One outbound frame pushed to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "kebab-case")]
pub enum OutboundEnvelope {
    /// Challenge details for the file-based handshake.
    ExternalAuthorizationResponse {
        file: PathBuf,
        token: String,
        identity: Identity,
    },
    /// Verification verdict; on failure the runtime closes the connection
    /// right after this frame.
    AuthorizationResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Generic acknowledgement for request/response actions.
    Ack {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Request-level error (gate rejection, malformed payload, unknown
    /// action).
    Error { reason: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
