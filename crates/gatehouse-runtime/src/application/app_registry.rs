//! Registry of running applications and registered external connections.
//!
//! Two populations share the identity namespace: core applications the
//! runtime launched itself, and external connections that completed the
//! authentication handshake.  Duplicate-identity checks during verification
//! consult both.
//!
//! Registration and removal follow mutate-then-emit ordering: the registry
//! state is updated and the lock released before the corresponding bus topic
//! fires, so a subscriber that looks the identity up during the callback
//! sees the post-transition state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use gatehouse_core::{ConnectionId, EventBus, Identity, Topic};

/// A registered external connection.
#[derive(Debug, Clone)]
pub struct ExternalConnection {
    pub identity: Identity,
    /// Transport connection the handshake completed on; `None` for entries
    /// registered out-of-band.
    pub connection_id: Option<ConnectionId>,
    /// Token the connection authenticated with.
    pub token: String,
}

#[derive(Default)]
struct RegistryInner {
    core_apps: HashSet<Identity>,
    external: HashMap<Identity, ExternalConnection>,
}

/// Shared application registry.
///
/// Cheap to clone; all clones observe the same tables.
#[derive(Clone)]
pub struct AppRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    bus: EventBus,
}

impl AppRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            bus,
        }
    }

    /// Records a core application the runtime launched.
    pub fn register_core_app(&self, identity: Identity) {
        self.inner.lock().unwrap().core_apps.insert(identity);
        debug!("core application {identity} registered");
    }

    /// Removes a core application and announces its shutdown.
    pub fn remove_core_app(&self, identity: Identity) {
        let removed = self.inner.lock().unwrap().core_apps.remove(&identity);
        if removed {
            info!("core application {identity} closed");
            self.bus.emit(Topic::ApplicationClosed(identity));
        }
    }

    /// Whether `identity` belongs to any running application, core or
    /// external.
    pub fn is_known(&self, identity: Identity) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.core_apps.contains(&identity) || inner.external.contains_key(&identity)
    }

    /// Whether `identity` is a registered (authenticated) external
    /// connection.
    pub fn is_external_registered(&self, identity: Identity) -> bool {
        self.inner.lock().unwrap().external.contains_key(&identity)
    }

    /// Registers an authenticated external connection and announces it.
    ///
    /// The [`Topic::ExternalApplicationConnected`] emission is what retires
    /// the matching pending handshake.
    pub fn register_external(&self, connection: ExternalConnection) {
        let identity = connection.identity;
        self.inner.lock().unwrap().external.insert(identity, connection);
        info!("external connection {identity} registered");
        self.bus.emit(Topic::ExternalApplicationConnected(identity));
    }

    /// Removes an external connection and announces its shutdown.  Removing
    /// an unknown identity is a no-op.
    pub fn remove_external(&self, identity: Identity) {
        let removed = self.inner.lock().unwrap().external.remove(&identity);
        if removed.is_some() {
            info!("external connection {identity} removed");
            self.bus.emit(Topic::ApplicationClosed(identity));
        }
    }

    /// Looks up a registered external connection.
    pub fn get_external(&self, identity: Identity) -> Option<ExternalConnection> {
        self.inner.lock().unwrap().external.get(&identity).cloned()
    }

    pub fn external_count(&self) -> usize {
        self.inner.lock().unwrap().external.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn external(identity: Identity) -> ExternalConnection {
        ExternalConnection {
            identity,
            connection_id: Some(1),
            token: "tok".to_string(),
        }
    }

    #[test]
    fn test_core_app_is_known_but_not_external() {
        let registry = AppRegistry::new(EventBus::new());
        let identity = Uuid::new_v4();

        registry.register_core_app(identity);

        assert!(registry.is_known(identity));
        assert!(!registry.is_external_registered(identity));
    }

    #[test]
    fn test_register_external_makes_identity_known_and_registered() {
        let registry = AppRegistry::new(EventBus::new());
        let identity = Uuid::new_v4();

        registry.register_external(external(identity));

        assert!(registry.is_known(identity));
        assert!(registry.is_external_registered(identity));
        assert_eq!(registry.external_count(), 1);
    }

    #[test]
    fn test_register_external_emits_connected_after_state_update() {
        // The subscriber must observe the registered entry from inside the
        // callback (mutate-then-emit ordering).
        let bus = EventBus::new();
        let registry = AppRegistry::new(bus.clone());
        let identity = Uuid::new_v4();

        let observed = Arc::new(AtomicUsize::new(0));
        let observed_cb = Arc::clone(&observed);
        let registry_cb = registry.clone();
        bus.subscribe_once(Topic::ExternalApplicationConnected(identity), move || {
            if registry_cb.is_external_registered(identity) {
                observed_cb.fetch_add(1, Ordering::SeqCst);
            }
        });

        registry.register_external(external(identity));

        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_external_emits_application_closed() {
        let bus = EventBus::new();
        let registry = AppRegistry::new(bus.clone());
        let identity = Uuid::new_v4();
        registry.register_external(external(identity));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        bus.subscribe_once(Topic::ApplicationClosed(identity), move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        registry.remove_external(identity);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!registry.is_known(identity));
    }

    #[test]
    fn test_remove_unknown_external_is_silent() {
        let bus = EventBus::new();
        let registry = AppRegistry::new(bus.clone());
        let identity = Uuid::new_v4();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        bus.subscribe_once(Topic::ApplicationClosed(identity), move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        registry.remove_external(identity);

        assert_eq!(fired.load(Ordering::SeqCst), 0, "no emission for a no-op removal");
    }

    #[test]
    fn test_remove_core_app_emits_application_closed() {
        let bus = EventBus::new();
        let registry = AppRegistry::new(bus.clone());
        let identity = Uuid::new_v4();
        registry.register_core_app(identity);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        bus.subscribe_once(Topic::ApplicationClosed(identity), move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        registry.remove_core_app(identity);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!registry.is_known(identity));
    }

    #[test]
    fn test_get_external_returns_stored_entry() {
        let registry = AppRegistry::new(EventBus::new());
        let identity = Uuid::new_v4();
        registry.register_external(external(identity));

        let entry = registry.get_external(identity).expect("stored entry");
        assert_eq!(entry.connection_id, Some(1));
        assert_eq!(entry.token, "tok");
    }
}
