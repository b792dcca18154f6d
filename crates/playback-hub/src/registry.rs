//! Consumer registry.
//!
//! Tracks external consumers by id and connects them to the player while an
//! instance is ready. Membership transitions are serialized: the map change
//! and the connect/disconnect calls it implies happen as one step, so a
//! replaced record can never stay connected. Listener notifications run after
//! that step, outside every registry lock, each isolated from the others'
//! panics. Consumers must not call back into the registry from `connect` or
//! `disconnect`.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use playback_hub_types::{Capabilities, MediaRef, RegistryStats};

use crate::error::{HubError, HubResult};
use crate::lifecycle::LifecycleObserver;

/// External observer/controller of the player (companion display, head unit,
/// background control surface).
pub trait Consumer: Send + Sync {
    /// Unique, non-empty identifier.
    fn id(&self) -> &str;
    fn connect(&self);
    fn disconnect(&self);
    fn is_connected(&self) -> bool;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn on_state_changed(&self, _playing: bool, _position_ms: u64, _speed: f32) {}
    fn on_media_changed(&self, _media: Option<&MediaRef>) {}
    fn on_seek_completed(&self, _position_ms: u64) {}
    fn on_volume_changed(&self, _volume: f32) {}
    /// The local presentation surface started (`true`) or stopped.
    fn on_presentation_mode_changed(&self, _presenting: bool) {}
}

/// Membership/connection transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryChange {
    Registered(String),
    Unregistered(String),
    Connected(String),
    Disconnected(String),
    Cleared,
}

pub trait RegistryListener: Send + Sync {
    fn on_registry_changed(&self, change: &RegistryChange);
}

#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: Mutex<BTreeMap<String, Arc<dyn Consumer>>>,
    listeners: Mutex<Vec<Arc<dyn RegistryListener>>>,
    // Held across each membership transition; the flag says whether an
    // instance is ready.
    transitions: Mutex<bool>,
}

impl ConsumerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn transitions(&self) -> MutexGuard<'_, bool> {
        self.transitions.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn consumers(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn Consumer>>> {
        self.consumers.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RegistryListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|err| err.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Add `consumer`, replacing (and disconnecting) any record with the same
    /// id. Connects it right away when an instance is ready.
    pub fn register(&self, consumer: Arc<dyn Consumer>) -> HubResult<()> {
        let id = consumer.id().trim().to_string();
        if id.is_empty() {
            return Err(HubError::InvalidConsumerRegistration(
                "consumer id must not be empty".to_string(),
            ));
        }
        let mut changes = Vec::new();
        {
            let ready = self.transitions();
            let prior = self.consumers().insert(id.clone(), consumer.clone());
            if let Some(prior) = prior {
                tracing::info!(consumer = %id, "replacing consumer with the same id");
                if self.disconnect_one(prior.as_ref()) {
                    changes.push(RegistryChange::Disconnected(id.clone()));
                }
            }
            changes.push(RegistryChange::Registered(id.clone()));
            if *ready && self.connect_one(consumer.as_ref()) {
                changes.push(RegistryChange::Connected(id.clone()));
            }
        }
        tracing::info!(
            consumer = %id,
            capabilities = ?consumer.capabilities().0,
            "consumer registered"
        );
        self.notify_all(&changes);
        Ok(())
    }

    /// Remove and disconnect `id`. Unknown ids are ignored.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = {
            let _ready = self.transitions();
            let removed = self.consumers().remove(id.trim());
            if let Some(consumer) = &removed {
                self.disconnect_one(consumer.as_ref());
            }
            removed
        };
        let Some(consumer) = removed else {
            return false;
        };
        tracing::info!(consumer = %consumer.id(), "consumer unregistered");
        self.notify(&RegistryChange::Unregistered(consumer.id().to_string()));
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.consumers().keys().cloned().collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Consumer>> {
        self.consumers().values().cloned().collect()
    }

    /// Connected consumers, in id order.
    pub fn connected(&self) -> Vec<Arc<dyn Consumer>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.is_connected())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connected().len()
    }

    pub fn has_connected_consumers(&self) -> bool {
        self.snapshot().iter().any(|c| c.is_connected())
    }

    /// Disconnect and drop every consumer, then detach every listener once
    /// they have heard about it.
    pub fn clear_all(&self) {
        let drained = {
            let _ready = self.transitions();
            let drained = std::mem::take(&mut *self.consumers());
            for consumer in drained.values() {
                self.disconnect_one(consumer.as_ref());
            }
            drained
        };
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "consumer registry cleared");
            self.notify(&RegistryChange::Cleared);
        }
        self.listeners
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
    }

    pub fn stats(&self) -> RegistryStats {
        let consumers = self.snapshot();
        RegistryStats {
            registered: consumers.len(),
            connected: consumers.iter().filter(|c| c.is_connected()).count(),
            listeners: self.listeners.lock().map(|l| l.len()).unwrap_or(0),
            ids: consumers.iter().map(|c| c.id().to_string()).collect(),
        }
    }

    /// Run `f` for every connected consumer, isolating panics.
    pub fn for_each_connected(&self, f: impl Fn(&dyn Consumer)) {
        for consumer in self.connected() {
            if catch_unwind(AssertUnwindSafe(|| f(consumer.as_ref()))).is_err() {
                tracing::error!(consumer = %consumer.id(), "consumer callback panicked");
            }
        }
    }

    fn connect_one(&self, consumer: &dyn Consumer) -> bool {
        if consumer.is_connected() {
            return false;
        }
        match catch_unwind(AssertUnwindSafe(|| consumer.connect())) {
            Ok(()) => {
                tracing::debug!(consumer = %consumer.id(), "consumer connected");
                true
            }
            Err(_) => {
                tracing::error!(consumer = %consumer.id(), "consumer connect panicked");
                false
            }
        }
    }

    fn disconnect_one(&self, consumer: &dyn Consumer) -> bool {
        if !consumer.is_connected() {
            return false;
        }
        match catch_unwind(AssertUnwindSafe(|| consumer.disconnect())) {
            Ok(()) => {
                tracing::debug!(consumer = %consumer.id(), "consumer disconnected");
                true
            }
            Err(_) => {
                tracing::error!(consumer = %consumer.id(), "consumer disconnect panicked");
                false
            }
        }
    }

    fn notify_all(&self, changes: &[RegistryChange]) {
        for change in changes {
            self.notify(change);
        }
    }

    fn notify(&self, change: &RegistryChange) {
        let listeners: Vec<Arc<dyn RegistryListener>> = self
            .listeners
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_registry_changed(change))).is_err() {
                tracing::error!(?change, "registry listener panicked");
            }
        }
    }
}

impl LifecycleObserver for ConsumerRegistry {
    fn on_ready(&self, _generation: u64) {
        let changes: Vec<RegistryChange> = {
            let mut ready = self.transitions();
            *ready = true;
            self.snapshot()
                .into_iter()
                .filter(|consumer| self.connect_one(consumer.as_ref()))
                .map(|consumer| RegistryChange::Connected(consumer.id().to_string()))
                .collect()
        };
        self.notify_all(&changes);
    }

    fn on_released(&self, _generation: u64) {
        let changes: Vec<RegistryChange> = {
            let mut ready = self.transitions();
            *ready = false;
            self.snapshot()
                .into_iter()
                .filter(|consumer| self.disconnect_one(consumer.as_ref()))
                .map(|consumer| RegistryChange::Disconnected(consumer.id().to_string()))
                .collect()
        };
        self.notify_all(&changes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ConsumerNotice, SimulatedConsumer};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Changes(Mutex<Vec<RegistryChange>>);

    impl RegistryListener for Changes {
        fn on_registry_changed(&self, change: &RegistryChange) {
            self.0.lock().unwrap().push(change.clone());
        }
    }

    struct Exploding;

    impl RegistryListener for Exploding {
        fn on_registry_changed(&self, _change: &RegistryChange) {
            panic!("listener failure");
        }
    }

    #[test]
    fn rejects_blank_ids() {
        let registry = ConsumerRegistry::new();
        assert!(matches!(
            registry.register(SimulatedConsumer::new("  ")),
            Err(HubError::InvalidConsumerRegistration(_))
        ));
        assert_eq!(registry.stats().registered, 0);
    }

    #[test]
    fn consumers_connect_only_while_resource_ready() {
        let registry = ConsumerRegistry::new();
        let early = SimulatedConsumer::new("watch.face");
        registry.register(early.clone()).unwrap();
        assert!(!early.is_connected());
        assert!(!registry.has_connected_consumers());

        registry.on_ready(1);
        assert!(early.is_connected());

        let late = SimulatedConsumer::new("dashboard");
        registry.register(late.clone()).unwrap();
        assert!(late.is_connected());
        assert_eq!(registry.connected_count(), 2);

        registry.on_released(1);
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(
            early.notices(),
            vec![ConsumerNotice::Connected, ConsumerNotice::Disconnected]
        );
    }

    #[test]
    fn duplicate_id_disconnects_prior_record() {
        let registry = ConsumerRegistry::new();
        registry.on_ready(1);
        let first = SimulatedConsumer::new("car.display");
        let second = SimulatedConsumer::new("car.display");
        registry.register(first.clone()).unwrap();
        registry.register(second.clone()).unwrap();

        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert_eq!(registry.ids(), vec!["car.display".to_string()]);
        let current = registry.get("car.display").unwrap();
        assert!(current.is_connected());
    }

    #[test]
    fn unregister_disconnects_and_ignores_unknown() {
        let registry = ConsumerRegistry::new();
        registry.on_ready(1);
        let consumer = SimulatedConsumer::new("remote");
        registry.register(consumer.clone()).unwrap();
        assert!(registry.unregister("remote"));
        assert!(!consumer.is_connected());
        assert!(!registry.unregister("remote"));
        assert!(registry.get("remote").is_none());
    }

    #[test]
    fn listeners_observe_changes_despite_panicking_peer() {
        let registry = ConsumerRegistry::new();
        let changes = Arc::new(Changes::default());
        registry.add_listener(Arc::new(Exploding));
        registry.add_listener(changes.clone());
        registry.on_ready(1);

        registry.register(SimulatedConsumer::new("a")).unwrap();
        registry.unregister("a");
        registry.register(SimulatedConsumer::new("b")).unwrap();
        registry.clear_all();

        assert_eq!(
            *changes.0.lock().unwrap(),
            vec![
                RegistryChange::Registered("a".into()),
                RegistryChange::Connected("a".into()),
                RegistryChange::Unregistered("a".into()),
                RegistryChange::Registered("b".into()),
                RegistryChange::Connected("b".into()),
                RegistryChange::Cleared,
            ]
        );

        assert_eq!(registry.stats().listeners, 0);
        let as_listener: Arc<dyn RegistryListener> = changes.clone();
        assert!(!registry.remove_listener(&as_listener));
    }

    /// Parks the first thread that reports `Registered` until released.
    struct Gate {
        parked: AtomicBool,
        entered: crossbeam_channel::Sender<()>,
        release: crossbeam_channel::Receiver<()>,
    }

    impl RegistryListener for Gate {
        fn on_registry_changed(&self, change: &RegistryChange) {
            if matches!(change, RegistryChange::Registered(_))
                && !self.parked.swap(true, Ordering::SeqCst)
            {
                let _ = self.entered.send(());
                let _ = self.release.recv_timeout(std::time::Duration::from_secs(5));
            }
        }
    }

    #[test]
    fn racing_registrations_leave_only_the_stored_record_connected() {
        let registry = ConsumerRegistry::new();
        registry.on_ready(1);
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        registry.add_listener(Arc::new(Gate {
            parked: AtomicBool::new(false),
            entered: entered_tx,
            release: release_rx,
        }));

        let first = SimulatedConsumer::new("dup");
        let second = SimulatedConsumer::new("dup");
        let slow = {
            let registry = registry.clone();
            let first = first.clone();
            std::thread::spawn(move || registry.register(first).unwrap())
        };
        entered_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();

        let fast = {
            let registry = registry.clone();
            let second = second.clone();
            std::thread::spawn(move || registry.register(second).unwrap())
        };
        fast.join().unwrap();
        release_tx.send(()).unwrap();
        slow.join().unwrap();

        assert!(!first.is_connected());
        assert!(second.is_connected());
        let stored = registry.get("dup").unwrap();
        assert!(std::ptr::eq(
            Arc::as_ptr(&stored) as *const (),
            Arc::as_ptr(&second) as *const ()
        ));
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn stats_report_membership() {
        let registry = ConsumerRegistry::new();
        let changes: Arc<dyn RegistryListener> = Arc::new(Changes::default());
        registry.add_listener(changes.clone());
        registry
            .register(SimulatedConsumer::with_capabilities(
                "b",
                Capabilities::default().with("seek", true),
            ))
            .unwrap();
        registry.register(SimulatedConsumer::new("a")).unwrap();
        registry.on_ready(3);
        registry.unregister("b");

        let stats = registry.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.listeners, 1);
        assert_eq!(stats.ids, vec!["a".to_string()]);

        assert!(registry.remove_listener(&changes));
        assert_eq!(registry.stats().listeners, 0);
    }
}
