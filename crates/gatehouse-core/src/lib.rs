//! # gatehouse-core
//!
//! Shared library for the Gatehouse runtime containing the wire protocol
//! message types, the identity model, and the typed event bus used to signal
//! authentication lifecycle transitions.
//!
//! This crate is used by the runtime daemon and by any in-process tooling
//! that speaks the external-connection protocol.  It has zero dependencies
//! on sockets, the filesystem, or an async runtime.
//!
//! - **`protocol`** – The JSON messages exchanged with external client
//!   processes: action names, request payloads, and the push responses the
//!   runtime sends back over a connection.
//!
//! - **`events`** – A typed publish/subscribe bus keyed by strongly-typed
//!   topics (identity, connection id).  Subscriptions are one-shot and
//!   explicitly cancellable, which is what makes exactly-once retirement of
//!   pending handshakes enforceable.
//!
//! - **`identity`** – Identity and connection-id aliases plus one-time token
//!   generation.

pub mod events;
pub mod identity;
pub mod protocol;

pub use events::{EventBus, Subscription, Topic};
pub use identity::{generate_token, ConnectionId, Identity};
pub use protocol::messages::{
    AuthorizationRequest, ExternalAuthRequest, InboundEnvelope, OutboundEnvelope,
    RegisterExternalConnectionRequest,
};
