//! Wire protocol for external client processes.
//!
//! Messages are JSON objects exchanged as WebSocket text frames.  Inbound
//! traffic is parsed into a loosely-typed [`messages::InboundEnvelope`]
//! (action string plus raw payload) so unknown actions can still be routed
//! through the authentication gate; outbound traffic is the strongly-typed
//! [`messages::OutboundEnvelope`].

pub mod messages;
