//! Application layer: the authentication protocol and its collaborators.
//!
//! - [`pending_auth`] — store of in-flight handshakes with exactly-once
//!   retirement.
//! - [`auth_protocol`] — the three wire operations (sponsored registration,
//!   external authorization request, verification).
//! - [`auth_gate`] — per-message authentication check.
//! - [`app_registry`] — known applications and registered external
//!   connections.
//! - [`dispatch`] — routes socket server events through the gate to the
//!   protocol.

pub mod app_registry;
pub mod auth_gate;
pub mod auth_protocol;
pub mod dispatch;
pub mod pending_auth;

use std::path::PathBuf;

use thiserror::Error;

use crate::infrastructure::network::ClientHandle;
use gatehouse_core::{ConnectionId, Identity};

pub use app_registry::{AppRegistry, ExternalConnection};
pub use auth_gate::{check_authenticated, ConnectionStrategy, GateError};
pub use auth_protocol::{
    AuthProtocol, InMemoryProcessTracker, LicenseReporter, LogLicenseReporter, ProcessTracker,
};
pub use dispatch::Dispatcher;
pub use pending_auth::{AuthKind, PendingAuthStore, PendingAuthentication};

/// Error type for the authentication protocol.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A pending record with neither a connection id nor a sponsor has no
    /// terminating failure event and can never be retired.
    #[error("pending authentication has no terminating event source")]
    InvalidPendingRecord,

    /// The presented identity already belongs to a running application.
    #[error("application with identity {0} already exists")]
    DuplicateIdentity(Identity),

    /// Verification arrived for an identity with no pending handshake.
    #[error("no pending authentication for identity {0}")]
    UnknownPendingAuth(Identity),

    /// The challenge file could not be read back during verification.
    #[error("could not read challenge file {path}: {source}")]
    ChallengeFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The presented token did not match the challenge.
    #[error("invalid token or file")]
    InvalidToken,
}

/// Lookup of connection handles by id.
///
/// Implemented by the socket server; test doubles back it with a fixed table.
/// Implementations return an inert stand-in for unknown ids, never an error.
pub trait ClientLookup: Send + Sync {
    fn get_client_by_id(&self, id: ConnectionId) -> ClientHandle;
}
