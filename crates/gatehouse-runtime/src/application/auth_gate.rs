//! Per-message authentication gate.
//!
//! Every inbound frame passes through [`check_authenticated`] before it is
//! routed.  Frames from in-process senders are trusted; frames from external
//! transport connections are admitted only when they are one of the three
//! authentication entry points or their resolved identity has completed the
//! handshake.

use thiserror::Error;

use gatehouse_core::protocol::messages::actions;
use gatehouse_core::InboundEnvelope;

use super::app_registry::AppRegistry;

/// Where a message entered the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStrategy {
    /// External transport connection (the socket server).
    External,
    /// In-process sender; trusted without a handshake.
    InProcess,
}

/// Error type for gate rejections.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("application is not authenticated")]
    NotAuthenticated,
}

/// Admits or rejects one inbound frame.
///
/// A forwarded peer-runtime identity on the envelope takes precedence over
/// the connection-local one, so a message relayed on behalf of an
/// authenticated application passes even when the relaying connection's own
/// identity does not.
///
/// # Errors
///
/// Returns [`GateError::NotAuthenticated`] when an external frame is neither
/// an authentication action nor from a registered external application.
pub fn check_authenticated(
    envelope: &InboundEnvelope,
    strategy: ConnectionStrategy,
    registry: &AppRegistry,
) -> Result<(), GateError> {
    if strategy != ConnectionStrategy::External {
        return Ok(());
    }
    if actions::is_authentication_action(&envelope.action) {
        return Ok(());
    }
    match envelope.resolved_identity() {
        Some(identity) if registry.is_external_registered(identity) => Ok(()),
        _ => Err(GateError::NotAuthenticated),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
