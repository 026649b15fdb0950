//! Routes socket server events through the gate to the protocol.
//!
//! The dispatcher drains the socket server's event channel on one task.
//! Every message is gated first; the three authentication actions are routed
//! to [`AuthProtocol`], and anything else that passed the gate is answered
//! with a not-handled error until a wider API surface exists.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gatehouse_core::protocol::messages::actions;
use gatehouse_core::{ConnectionId, InboundEnvelope, OutboundEnvelope};

use crate::infrastructure::network::ServerEvent;

use super::auth_gate::{check_authenticated, ConnectionStrategy};
use super::auth_protocol::AuthProtocol;
use super::{AppRegistry, ClientLookup};

/// Event-loop router for one socket server.
pub struct Dispatcher {
    protocol: Arc<AuthProtocol>,
    registry: AppRegistry,
    clients: Arc<dyn ClientLookup>,
}

impl Dispatcher {
    pub fn new(
        protocol: Arc<AuthProtocol>,
        registry: AppRegistry,
        clients: Arc<dyn ClientLookup>,
    ) -> Self {
        Self {
            protocol,
            registry,
            clients,
        }
    }

    /// Drains `events` until the socket server drops its sender.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Connection { id } => {
                    debug!("connection {id} entered dispatch");
                }
                ServerEvent::Message { id, envelope } => {
                    self.handle_message(id, envelope).await;
                }
                ServerEvent::Closed { id } => {
                    debug!("connection {id} left dispatch");
                }
                ServerEvent::Error { id, error } => {
                    warn!("connection {id} transport error: {error}");
                }
            }
        }
        info!("dispatch loop stopped");
    }

    async fn handle_message(&self, id: ConnectionId, envelope: InboundEnvelope) {
        let client = self.clients.get_client_by_id(id);

        if let Err(e) = check_authenticated(&envelope, ConnectionStrategy::External, &self.registry)
        {
            warn!("connection {id}: '{}' rejected: {e}", envelope.action);
            client.send(OutboundEnvelope::Error {
                reason: e.to_string(),
            });
            return;
        }

        match envelope.action.as_str() {
            actions::REGISTER_EXTERNAL_CONNECTION => {
                let request: gatehouse_core::RegisterExternalConnectionRequest =
                    match envelope.parse_payload() {
                        Ok(request) => request,
                        Err(e) => return self.reject_payload(&client, id, &envelope.action, e),
                    };
                let Some(sponsor) = envelope.resolved_identity() else {
                    client.send(OutboundEnvelope::Error {
                        reason: "sponsor identity required".to_string(),
                    });
                    return;
                };
                match self.protocol.register_sponsored(sponsor, request.identity) {
                    Ok((identity, token)) => client.send(OutboundEnvelope::Ack {
                        success: true,
                        data: Some(json!({ "identity": identity, "token": token })),
                    }),
                    Err(e) => client.send(OutboundEnvelope::Error {
                        reason: e.to_string(),
                    }),
                }
            }
            actions::REQUEST_EXTERNAL_AUTHORIZATION => {
                let request = match envelope.parse_payload() {
                    Ok(request) => request,
                    Err(e) => return self.reject_payload(&client, id, &envelope.action, e),
                };
                if let Err(e) = self.protocol.request_external_auth(id, request) {
                    warn!("connection {id}: challenge issue failed: {e}");
                }
            }
            actions::REQUEST_AUTHORIZATION => {
                let request = match envelope.parse_payload() {
                    Ok(request) => request,
                    Err(e) => return self.reject_payload(&client, id, &envelope.action, e),
                };
                // verify answers and closes the connection itself; the
                // returned cause is only worth a log line here.
                if let Err(e) = self.protocol.verify(id, request).await {
                    debug!("connection {id}: verification failed: {e}");
                }
            }
            other => {
                client.send(OutboundEnvelope::Error {
                    reason: format!("action '{other}' is not handled"),
                });
            }
        }
    }

    fn reject_payload(
        &self,
        client: &crate::infrastructure::network::ClientHandle,
        id: ConnectionId,
        action: &str,
        error: serde_json::Error,
    ) {
        warn!("connection {id}: malformed '{action}' payload: {error}");
        client.send(OutboundEnvelope::Error {
            reason: format!("malformed payload for '{action}'"),
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
