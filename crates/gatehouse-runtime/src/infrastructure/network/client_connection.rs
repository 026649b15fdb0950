//! Per-connection client handle.
//!
//! A [`ClientHandle`] is the only way the rest of the runtime talks to one
//! transport connection: `send` queues an outbound frame, `close` asks the
//! connection's writer task to shut the stream down, and `is_open` reflects
//! the transport's live state.  Handles are cheap to clone and remain safe
//! to use after the connection has closed: every operation degrades to a
//! logged no-op, so callers never need to null-check.
//!
//! The inert variant returned by [`ClientHandle::inert`] backs the socket
//! server's lookup-by-id for ids that are not currently active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gatehouse_core::OutboundEnvelope;
use tokio::sync::mpsc;
use tracing::debug;

/// Command consumed by a connection's writer task.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Serialize and write one frame.
    Send(OutboundEnvelope),
    /// Close the underlying transport stream.
    Close,
}

#[derive(Clone)]
struct HandleInner {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    open: Arc<AtomicBool>,
}

/// Shared handle to one live (or formerly live) connection.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Option<HandleInner>,
}

impl ClientHandle {
    /// Creates a live handle together with the command receiver its writer
    /// task (or a test double) drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Some(HandleInner {
                commands: tx,
                open: Arc::new(AtomicBool::new(true)),
            }),
        };
        (handle, rx)
    }

    /// Stand-in for an unknown or already-released connection id.
    ///
    /// `send` and `close` do nothing; `is_open` reports `false`.
    pub fn inert() -> Self {
        Self { inner: None }
    }

    /// Queues one outbound frame.  A send after close is a no-op.
    pub fn send(&self, message: OutboundEnvelope) {
        match &self.inner {
            Some(inner) => {
                if inner.commands.send(ConnectionCommand::Send(message)).is_err() {
                    debug!("send on closed connection dropped");
                }
            }
            None => debug!("send on inert connection handle dropped"),
        }
    }

    /// Asks the writer task to close the transport.  Idempotent.
    pub fn close(&self) {
        if let Some(inner) = &self.inner {
            if inner.commands.send(ConnectionCommand::Close).is_err() {
                debug!("close on already-closed connection ignored");
            }
        }
    }

    /// Whether the transport is still live and accepting frames.
    pub fn is_open(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.open.load(Ordering::Relaxed) && !inner.commands.is_closed(),
            None => false,
        }
    }

    /// Marks the transport as no longer live.
    ///
    /// Called by the socket server when the underlying stream ends; test
    /// doubles may call it to simulate a closed peer.
    pub fn mark_closed(&self) {
        if let Some(inner) = &self.inner {
            inner.open.store(false, Ordering::Relaxed);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
