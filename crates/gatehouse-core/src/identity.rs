//! Identity and connection-id types.
//!
//! An [`Identity`] names an application or external process for the lifetime
//! of the runtime; it is the key of the pending-authentication map and of the
//! registered-application tables.  A [`ConnectionId`] names one live transport
//! connection; ids are pool-allocated and reused after a connection closes,
//! so they must never be stored past the connection's `close` event.

use uuid::Uuid;

/// Unique application/process identity, analogous to a session principal.
pub type Identity = Uuid;

/// Opaque identifier for one active transport connection.
///
/// Allocated from a cycling pool by the socket server; unique only among
/// currently open connections.
pub type ConnectionId = u32;

/// Generates a fresh single-use secret suitable as a handshake token.
///
/// Tokens are random v4 UUIDs rendered in the canonical hyphenated form.
/// They are never persisted and are invalidated by the first verification
/// attempt against them.
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
