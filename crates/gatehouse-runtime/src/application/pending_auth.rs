//! Store of in-flight authentication handshakes.
//!
//! Every pending record arms two one-shot bus subscriptions when it is
//! inserted: the success topic (its identity finished registering as an
//! external application) and a failure topic derived from the record (the
//! requesting connection closed, or the sponsoring application shut down).
//! Whichever fires first runs the shared retirement closure, which cancels
//! the sibling subscription, deletes the challenge file if the record owns
//! one, and removes the record.  Retirement is exactly-once for **both**
//! record kinds: after any terminating event the store holds nothing for
//! that identity and the bus holds no dangling subscriptions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use gatehouse_core::{
    ConnectionId, EventBus, ExternalAuthRequest, Identity, Subscription, Topic,
};

use super::AuthError;

/// How a pending identity proves itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// The requester must write the issued token into the challenge file;
    /// verification reads the file back and looks for the token as a
    /// substring.
    FileChallenge,
    /// A sponsor received the token out-of-band; verification requires exact
    /// token equality.
    SponsoredToken,
}

/// One in-flight handshake.
#[derive(Debug, Clone)]
pub struct PendingAuthentication {
    pub identity: Identity,
    pub kind: AuthKind,
    /// The expected token.
    pub token: String,
    /// Connection the authorization request arrived on; its close is the
    /// failure event for direct requests.
    pub connection_id: Option<ConnectionId>,
    /// Sponsoring application; its shutdown is the failure event for
    /// sponsored records.
    pub sponsor_identity: Option<Identity>,
    /// The request that opened the handshake, kept for the post-auth
    /// license report.
    pub original_request: ExternalAuthRequest,
    /// Challenge file owned by this record until retirement.
    pub challenge_file: Option<PathBuf>,
}

struct StoredRecord {
    record: PendingAuthentication,
    retire: Arc<dyn Fn() + Send + Sync>,
}

/// Shared store of pending handshakes.
///
/// Cheap to clone; all clones observe the same records.
#[derive(Clone)]
pub struct PendingAuthStore {
    inner: Arc<Mutex<HashMap<Identity, StoredRecord>>>,
    bus: EventBus,
}

impl PendingAuthStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }

    /// Inserts a pending record and arms its retirement subscriptions.
    ///
    /// Inserting an identity that already has a live record keeps the
    /// original and returns `Ok` (retransmitted requests must not disturb a
    /// handshake in progress).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidPendingRecord`] when the record carries
    /// neither a connection id nor a sponsor identity; such a record has no
    /// failure event and would pend forever.  The store is left untouched.
    pub fn insert(&self, record: PendingAuthentication) -> Result<(), AuthError> {
        let identity = record.identity;
        let failure_topic = match (record.connection_id, record.sponsor_identity) {
            (Some(connection_id), _) => Topic::ConnectionClosed(connection_id),
            (None, Some(sponsor)) => Topic::ApplicationClosed(sponsor),
            (None, None) => return Err(AuthError::InvalidPendingRecord),
        };
        let success_topic = Topic::ExternalApplicationConnected(identity);

        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&identity) {
            warn!("pending authentication for {identity} already exists, keeping the original");
            return Ok(());
        }

        let slot: Arc<Mutex<Option<(Subscription, Subscription)>>> = Arc::new(Mutex::new(None));
        let retire: Arc<dyn Fn() + Send + Sync> = {
            let map = Arc::downgrade(&self.inner);
            let slot = Arc::clone(&slot);
            let challenge_file = record.challenge_file.clone();
            Arc::new(move || {
                // take() makes retirement exactly-once no matter which topic
                // fires first or how many paths race here.
                let Some((success, failure)) = slot.lock().unwrap().take() else {
                    return;
                };
                success.cancel();
                failure.cancel();
                if let Some(path) = &challenge_file {
                    match std::fs::remove_file(path) {
                        Ok(()) => debug!("challenge file {} removed", path.display()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!("could not remove challenge file {}: {e}", path.display());
                        }
                    }
                }
                if let Some(map) = map.upgrade() {
                    map.lock().unwrap().remove(&identity);
                }
                debug!("pending authentication for {identity} retired");
            })
        };

        let on_success = {
            let retire = Arc::clone(&retire);
            move || retire()
        };
        let on_failure = {
            let retire = Arc::clone(&retire);
            move || retire()
        };
        *slot.lock().unwrap() = Some((
            self.bus.subscribe_once(success_topic, on_success),
            self.bus.subscribe_once(failure_topic, on_failure),
        ));

        map.insert(identity, StoredRecord { record, retire });
        Ok(())
    }

    /// Looks up the pending record for `identity`.
    pub fn get(&self, identity: Identity) -> Option<PendingAuthentication> {
        self.inner
            .lock()
            .unwrap()
            .get(&identity)
            .map(|stored| stored.record.clone())
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.inner.lock().unwrap().contains_key(&identity)
    }

    /// Retires the record for `identity` directly, without waiting for a
    /// bus event.  Removing an unknown or already-retired identity is a
    /// no-op.
    pub fn remove(&self, identity: Identity) {
        let retire = self
            .inner
            .lock()
            .unwrap()
            .get(&identity)
            .map(|stored| Arc::clone(&stored.retire));
        if let Some(retire) = retire {
            retire();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
