//! The external-connection authentication protocol.
//!
//! Three operations drive the handshake:
//!
//! 1. `register_sponsored` — a running application pre-authorizes a future
//!    connection and carries the `{identity, token}` pair to it out-of-band.
//! 2. `request_external_auth` — an unknown process asks for a file
//!    challenge; the runtime issues a token and a file path and expects the
//!    process to write the token into the file.
//! 3. `verify` — the process presents `{identity, token}`; the runtime
//!    checks the challenge, then either registers the external application
//!    and reports license info, or pushes a failure response and closes the
//!    connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gatehouse_core::{
    generate_token, AuthorizationRequest, ConnectionId, ExternalAuthRequest, Identity,
    OutboundEnvelope,
};

use super::app_registry::{AppRegistry, ExternalConnection};
use super::pending_auth::{AuthKind, PendingAuthStore, PendingAuthentication};
use super::{AuthError, ClientLookup};

// ── Collaborator interfaces ───────────────────────────────────────────────────

/// Maps OS process ids to application identities.
///
/// An external process the runtime itself spawned is recognised by pid and
/// keeps the identity it was launched under, whatever it asks for.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessTracker: Send + Sync {
    fn identity_for_pid(&self, pid: u32) -> Option<Identity>;
}

/// In-process [`ProcessTracker`] backed by a table the runtime maintains as
/// it spawns and reaps child processes.
#[derive(Default)]
pub struct InMemoryProcessTracker {
    map: Mutex<HashMap<u32, Identity>>,
}

impl InMemoryProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, pid: u32, identity: Identity) {
        self.map.lock().unwrap().insert(pid, identity);
    }

    pub fn untrack(&self, pid: u32) {
        self.map.lock().unwrap().remove(&pid);
    }
}

impl ProcessTracker for InMemoryProcessTracker {
    fn identity_for_pid(&self, pid: u32) -> Option<Identity> {
        self.map.lock().unwrap().get(&pid).copied()
    }
}

/// Post-authentication license registration side effect.
#[async_trait]
pub trait LicenseReporter: Send + Sync {
    async fn report(&self, identity: Identity, request: &ExternalAuthRequest);
}

/// Default reporter that records the license info in the log stream.
pub struct LogLicenseReporter;

#[async_trait]
impl LicenseReporter for LogLicenseReporter {
    async fn report(&self, identity: Identity, request: &ExternalAuthRequest) {
        info!(
            %identity,
            config_url = request.config_url.as_deref().unwrap_or_default(),
            client = request.client.as_deref().unwrap_or_default(),
            "license info recorded for authenticated external connection"
        );
    }
}

// ── Protocol ──────────────────────────────────────────────────────────────────

/// Drives the authentication handshake over the connection registry.
pub struct AuthProtocol {
    store: PendingAuthStore,
    registry: AppRegistry,
    clients: Arc<dyn ClientLookup>,
    process_tracker: Arc<dyn ProcessTracker>,
    license_reporter: Arc<dyn LicenseReporter>,
    challenge_dir: PathBuf,
}

impl AuthProtocol {
    pub fn new(
        store: PendingAuthStore,
        registry: AppRegistry,
        clients: Arc<dyn ClientLookup>,
        process_tracker: Arc<dyn ProcessTracker>,
        license_reporter: Arc<dyn LicenseReporter>,
        challenge_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            registry,
            clients,
            process_tracker,
            license_reporter,
            challenge_dir,
        }
    }

    /// Pre-authorizes a future external connection on behalf of `sponsor`.
    ///
    /// Returns the `{identity, token}` pair the sponsor hands to the
    /// connecting process out-of-band.  The pending record fails over to
    /// sponsor shutdown, so an unredeemed token dies with its sponsor.
    ///
    /// # Errors
    ///
    /// Propagates [`AuthError`] from the pending store.
    pub fn register_sponsored(
        &self,
        sponsor: Identity,
        requested_identity: Option<Identity>,
    ) -> Result<(Identity, String), AuthError> {
        let identity = requested_identity.unwrap_or_else(Uuid::new_v4);
        let token = generate_token();

        self.store.insert(PendingAuthentication {
            identity,
            kind: AuthKind::SponsoredToken,
            token: token.clone(),
            connection_id: None,
            sponsor_identity: Some(sponsor),
            original_request: ExternalAuthRequest::default(),
            challenge_file: None,
        })?;

        debug!("sponsored authentication for {identity} registered by {sponsor}");
        Ok((identity, token))
    }

    /// Opens a file-challenge handshake for the process on `connection_id`.
    ///
    /// The identity is resolved in priority order: the process tracker's
    /// mapping for the request's pid, then the identity the request asked
    /// for, then a freshly generated one.  A request for an identity that
    /// already has a live handshake is dropped without a reply, so
    /// retransmits cannot disturb a handshake in progress.
    ///
    /// # Errors
    ///
    /// Propagates [`AuthError`] from the pending store.
    pub fn request_external_auth(
        &self,
        connection_id: ConnectionId,
        request: ExternalAuthRequest,
    ) -> Result<(), AuthError> {
        let identity = request
            .process_id
            .and_then(|pid| self.process_tracker.identity_for_pid(pid))
            .or(request.identity)
            .unwrap_or_else(Uuid::new_v4);

        if self.store.contains(identity) {
            debug!("external auth request for {identity} already pending, dropped");
            return Ok(());
        }

        let token = generate_token();
        let file = self
            .challenge_dir
            .join(format!("gatehouse-challenge-{}", Uuid::new_v4()));

        self.store.insert(PendingAuthentication {
            identity,
            kind: AuthKind::FileChallenge,
            token: token.clone(),
            connection_id: Some(connection_id),
            sponsor_identity: None,
            original_request: request,
            challenge_file: Some(file.clone()),
        })?;

        let handle = self.clients.get_client_by_id(connection_id);
        if !handle.is_open() {
            // The requester vanished between the message and now; its close
            // event may already have fired before our subscription existed.
            warn!("connection {connection_id} closed before challenge issue, retiring {identity}");
            self.store.remove(identity);
            return Ok(());
        }

        handle.send(OutboundEnvelope::ExternalAuthorizationResponse {
            file,
            token,
            identity,
        });
        Ok(())
    }

    /// Verifies a presented `{identity, token}` pair.
    ///
    /// On success the external application is registered (which retires the
    /// pending record) and the license info from the originating request is
    /// reported.  On failure the connection receives a
    /// `{success: false, reason}` response and is closed.
    ///
    /// # Errors
    ///
    /// Returns the failure cause after the response has been pushed and the
    /// close requested; callers only log it.
    pub async fn verify(
        &self,
        connection_id: ConnectionId,
        request: AuthorizationRequest,
    ) -> Result<(), AuthError> {
        let handle = self.clients.get_client_by_id(connection_id);
        match self.evaluate(&request).await {
            Ok(record) => {
                handle.send(OutboundEnvelope::AuthorizationResponse {
                    success: true,
                    reason: None,
                });
                self.registry.register_external(ExternalConnection {
                    identity: request.identity,
                    connection_id: Some(connection_id),
                    token: record.token.clone(),
                });
                self.license_reporter
                    .report(request.identity, &record.original_request)
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!("authorization of {} failed: {e}", request.identity);
                handle.send(OutboundEnvelope::AuthorizationResponse {
                    success: false,
                    reason: Some(e.to_string()),
                });
                handle.close();
                Err(e)
            }
        }
    }

    /// Decides the verification outcome without touching the connection.
    ///
    /// Outcome precedence: a duplicate identity rejects before the pending
    /// store is consulted, so a token for a name that is already running is
    /// useless even when a handshake is pending.
    async fn evaluate(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<PendingAuthentication, AuthError> {
        if self.registry.is_known(request.identity) {
            return Err(AuthError::DuplicateIdentity(request.identity));
        }

        let record = self
            .store
            .get(request.identity)
            .ok_or(AuthError::UnknownPendingAuth(request.identity))?;

        match record.kind {
            AuthKind::FileChallenge => {
                let path = record.challenge_file.clone().ok_or(AuthError::InvalidToken)?;
                let contents = tokio::fs::read_to_string(&path).await.map_err(|source| {
                    AuthError::ChallengeFileUnreadable {
                        path: path.clone(),
                        source,
                    }
                })?;
                if contents.contains(&record.token) {
                    Ok(record)
                } else {
                    Err(AuthError::InvalidToken)
                }
            }
            AuthKind::SponsoredToken => {
                if record.token == request.token {
                    Ok(record)
                } else {
                    Err(AuthError::InvalidToken)
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::{ClientHandle, ConnectionCommand};
    use gatehouse_core::{EventBus, Topic};
    use tokio::sync::mpsc;

    /// Fixed-table [`ClientLookup`] double.
    #[derive(Default)]
    struct FakeClients {
        handles: Mutex<HashMap<ConnectionId, ClientHandle>>,
    }

    impl FakeClients {
        fn add(&self, id: ConnectionId) -> mpsc::UnboundedReceiver<ConnectionCommand> {
            let (handle, rx) = ClientHandle::channel();
            self.handles.lock().unwrap().insert(id, handle);
            rx
        }
    }

    impl ClientLookup for FakeClients {
        fn get_client_by_id(&self, id: ConnectionId) -> ClientHandle {
            self.handles
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .unwrap_or_else(ClientHandle::inert)
        }
    }

    struct Harness {
        bus: EventBus,
        store: PendingAuthStore,
        registry: AppRegistry,
        clients: Arc<FakeClients>,
        protocol: AuthProtocol,
        challenge_dir: PathBuf,
    }

    fn harness() -> Harness {
        harness_with_tracker(Arc::new(InMemoryProcessTracker::new()))
    }

    fn harness_with_tracker(tracker: Arc<dyn ProcessTracker>) -> Harness {
        let bus = EventBus::new();
        let store = PendingAuthStore::new(bus.clone());
        let registry = AppRegistry::new(bus.clone());
        let clients = Arc::new(FakeClients::default());
        let challenge_dir = std::env::temp_dir().join(format!("gatehouse-proto-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&challenge_dir).unwrap();
        let protocol = AuthProtocol::new(
            store.clone(),
            registry.clone(),
            Arc::clone(&clients) as Arc<dyn ClientLookup>,
            tracker,
            Arc::new(LogLicenseReporter),
            challenge_dir.clone(),
        );
        Harness {
            bus,
            store,
            registry,
            clients,
            protocol,
            challenge_dir,
        }
    }

    fn expect_send(rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>) -> OutboundEnvelope {
        match rx.try_recv() {
            Ok(ConnectionCommand::Send(frame)) => frame,
            other => panic!("expected a queued frame, got {other:?}"),
        }
    }

    // ── Sponsored registration ────────────────────────────────────────────────

    #[test]
    fn test_register_sponsored_creates_pending_record() {
        let h = harness();
        let sponsor = Uuid::new_v4();

        let (identity, token) = h.protocol.register_sponsored(sponsor, None).unwrap();

        let record = h.store.get(identity).expect("pending record");
        assert_eq!(record.kind, AuthKind::SponsoredToken);
        assert_eq!(record.token, token);
        assert_eq!(record.sponsor_identity, Some(sponsor));
        assert_eq!(record.connection_id, None);
    }

    #[test]
    fn test_register_sponsored_honours_requested_identity() {
        let h = harness();
        let requested = Uuid::new_v4();

        let (identity, _) = h
            .protocol
            .register_sponsored(Uuid::new_v4(), Some(requested))
            .unwrap();

        assert_eq!(identity, requested);
    }

    #[test]
    fn test_sponsored_record_dies_with_its_sponsor() {
        let h = harness();
        let sponsor = Uuid::new_v4();
        h.registry.register_core_app(sponsor);
        let (identity, _) = h.protocol.register_sponsored(sponsor, None).unwrap();

        h.registry.remove_core_app(sponsor);

        assert!(!h.store.contains(identity), "unredeemed token must die with the sponsor");
    }

    // ── External authorization request ────────────────────────────────────────

    #[test]
    fn test_request_external_auth_issues_challenge() {
        let h = harness();
        let mut rx = h.clients.add(1);
        let requested = Uuid::new_v4();

        h.protocol
            .request_external_auth(
                1,
                ExternalAuthRequest {
                    identity: Some(requested),
                    ..Default::default()
                },
            )
            .unwrap();

        let frame = expect_send(&mut rx);
        match frame {
            OutboundEnvelope::ExternalAuthorizationResponse {
                file,
                token,
                identity,
            } => {
                assert_eq!(identity, requested);
                assert!(file.starts_with(&h.challenge_dir));
                let record = h.store.get(requested).expect("pending record");
                assert_eq!(record.token, token);
                assert_eq!(record.kind, AuthKind::FileChallenge);
                assert_eq!(record.connection_id, Some(1));
                assert_eq!(record.challenge_file, Some(file));
            }
            other => panic!("expected challenge frame, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_external_auth_request_is_silently_dropped() {
        let h = harness();
        let mut rx = h.clients.add(1);
        let identity = Uuid::new_v4();
        let request = ExternalAuthRequest {
            identity: Some(identity),
            ..Default::default()
        };

        h.protocol.request_external_auth(1, request.clone()).unwrap();
        let first = expect_send(&mut rx);

        // Retransmit on a second connection: no reply, original untouched.
        let mut rx2 = h.clients.add(2);
        h.protocol.request_external_auth(2, request).unwrap();

        assert!(rx2.try_recv().is_err(), "duplicate must receive nothing");
        let record = h.store.get(identity).unwrap();
        assert_eq!(record.connection_id, Some(1), "original record untouched");
        match first {
            OutboundEnvelope::ExternalAuthorizationResponse { token, .. } => {
                assert_eq!(record.token, token);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_process_tracker_identity_wins_over_requested() {
        let tracked = Uuid::new_v4();
        let mut tracker = MockProcessTracker::new();
        tracker
            .expect_identity_for_pid()
            .withf(|pid| *pid == 4242)
            .return_const(Some(tracked));
        let h = harness_with_tracker(Arc::new(tracker));
        let mut rx = h.clients.add(1);

        h.protocol
            .request_external_auth(
                1,
                ExternalAuthRequest {
                    identity: Some(Uuid::new_v4()),
                    process_id: Some(4242),
                    ..Default::default()
                },
            )
            .unwrap();

        match expect_send(&mut rx) {
            OutboundEnvelope::ExternalAuthorizationResponse { identity, .. } => {
                assert_eq!(identity, tracked, "tracked pid overrides the requested identity");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(h.store.contains(tracked));
    }

    #[test]
    fn test_request_from_closed_connection_leaves_no_record() {
        let h = harness();
        let rx = h.clients.add(1);
        drop(rx); // transport gone

        h.protocol
            .request_external_auth(1, ExternalAuthRequest::default())
            .unwrap();

        assert!(h.store.is_empty(), "no pending record for a vanished requester");
        assert_eq!(h.bus.subscription_count(), 0);
    }

    // ── Verification: file challenge ──────────────────────────────────────────

    #[tokio::test]
    async fn test_file_challenge_succeeds_when_file_contains_token() {
        let h = harness();
        let mut rx = h.clients.add(1);
        h.protocol
            .request_external_auth(1, ExternalAuthRequest::default())
            .unwrap();
        let (identity, token, file) = match expect_send(&mut rx) {
            OutboundEnvelope::ExternalAuthorizationResponse {
                file,
                token,
                identity,
            } => (identity, token, file),
            other => panic!("unexpected frame {other:?}"),
        };

        // Token embedded in surrounding text still verifies.
        std::fs::write(&file, format!("x{token}y")).unwrap();

        h.protocol
            .verify(1, AuthorizationRequest { identity, token })
            .await
            .expect("verification succeeds");

        match expect_send(&mut rx) {
            OutboundEnvelope::AuthorizationResponse { success, reason } => {
                assert!(success);
                assert_eq!(reason, None);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(h.registry.is_external_registered(identity));
        assert!(h.store.is_empty(), "record retired on registration");
        assert!(!file.exists(), "challenge file deleted at retirement");
    }

    #[tokio::test]
    async fn test_file_challenge_fails_on_wrong_file_contents() {
        let h = harness();
        let mut rx = h.clients.add(1);
        h.protocol
            .request_external_auth(1, ExternalAuthRequest::default())
            .unwrap();
        let (identity, token, file) = match expect_send(&mut rx) {
            OutboundEnvelope::ExternalAuthorizationResponse {
                file,
                token,
                identity,
            } => (identity, token, file),
            other => panic!("unexpected frame {other:?}"),
        };

        std::fs::write(&file, "tokn123").unwrap();

        let result = h
            .protocol
            .verify(1, AuthorizationRequest { identity, token })
            .await;

        assert!(matches!(result, Err(AuthError::InvalidToken)));
        match expect_send(&mut rx) {
            OutboundEnvelope::AuthorizationResponse { success, reason } => {
                assert!(!success);
                assert_eq!(reason.as_deref(), Some("invalid token or file"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        // The connection is asked to close; the close event retires the
        // record and deletes the file.
        assert!(matches!(rx.try_recv(), Ok(ConnectionCommand::Close)));
        h.bus.emit(Topic::ConnectionClosed(1));
        assert!(h.store.is_empty());
        assert!(!file.exists());
        assert!(!h.registry.is_external_registered(identity));
    }

    #[tokio::test]
    async fn test_unreadable_challenge_file_resolves_to_failure() {
        let h = harness();
        let mut rx = h.clients.add(1);
        h.protocol
            .request_external_auth(1, ExternalAuthRequest::default())
            .unwrap();
        let (identity, token, file) = match expect_send(&mut rx) {
            OutboundEnvelope::ExternalAuthorizationResponse {
                file,
                token,
                identity,
            } => (identity, token, file),
            other => panic!("unexpected frame {other:?}"),
        };
        // Never write the file: the read must fail, not hang.
        assert!(!file.exists());

        let result = h
            .protocol
            .verify(1, AuthorizationRequest { identity, token })
            .await;

        assert!(matches!(result, Err(AuthError::ChallengeFileUnreadable { .. })));
        assert!(!h.registry.is_external_registered(identity));
    }

    // ── Verification: sponsored token ─────────────────────────────────────────

    #[tokio::test]
    async fn test_sponsored_verification_requires_exact_token() {
        let h = harness();
        let mut rx = h.clients.add(1);
        let (identity, token) = h.protocol.register_sponsored(Uuid::new_v4(), None).unwrap();

        h.protocol
            .verify(1, AuthorizationRequest { identity, token })
            .await
            .expect("exact token verifies");

        match expect_send(&mut rx) {
            OutboundEnvelope::AuthorizationResponse { success, .. } => assert!(success),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(h.registry.is_external_registered(identity));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_sponsored_verification_is_case_sensitive() {
        let h = harness();
        let _rx = h.clients.add(1);
        let (identity, token) = h.protocol.register_sponsored(Uuid::new_v4(), None).unwrap();

        let result = h
            .protocol
            .verify(
                1,
                AuthorizationRequest {
                    identity,
                    token: token.to_uppercase(),
                },
            )
            .await;

        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_failed_sponsored_attempt_leaves_record_pending() {
        // Closing the verifying connection is not the sponsored record's
        // failure event; the pair stays redeemable until the sponsor dies.
        let h = harness();
        let _rx = h.clients.add(1);
        let (identity, _) = h.protocol.register_sponsored(Uuid::new_v4(), None).unwrap();

        let _ = h
            .protocol
            .verify(
                1,
                AuthorizationRequest {
                    identity,
                    token: "wrong".to_string(),
                },
            )
            .await;

        h.bus.emit(Topic::ConnectionClosed(1));
        assert!(h.store.contains(identity), "sponsored record survives a failed attempt");
    }

    // ── Verification: precedence ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_duplicate_identity_rejects_before_pending_lookup() {
        let h = harness();
        let _rx = h.clients.add(1);
        let (identity, token) = h.protocol.register_sponsored(Uuid::new_v4(), None).unwrap();
        // Same identity comes alive as a core app before redemption.
        h.registry.register_core_app(identity);

        let result = h
            .protocol
            .verify(1, AuthorizationRequest { identity, token })
            .await;

        assert!(
            matches!(result, Err(AuthError::DuplicateIdentity(id)) if id == identity),
            "duplicate identity must win over the valid pending token"
        );
    }

    #[tokio::test]
    async fn test_unknown_identity_is_rejected() {
        let h = harness();
        let _rx = h.clients.add(1);
        let identity = Uuid::new_v4();

        let result = h
            .protocol
            .verify(
                1,
                AuthorizationRequest {
                    identity,
                    token: "t".to_string(),
                },
            )
            .await;

        assert!(matches!(result, Err(AuthError::UnknownPendingAuth(id)) if id == identity));
    }
}
