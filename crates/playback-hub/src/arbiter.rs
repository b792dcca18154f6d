//! Presentation arbiter.
//!
//! Decides whether the local presentation surface may render controls. The
//! surface is suppressed while an external takeover integration (car head
//! unit and the like) is connected or the environment reports a takeover
//! context. Each show/hide transition is applied to the surface exactly once.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use playback_hub_types::{ControlAction, PlaybackSnapshot, PresentationDescriptor};

use crate::error::HubError;
use crate::events::{ResourceEvent, ResourceListener};
use crate::lifecycle::LifecycleObserver;
use crate::proxy::ResourceProxy;
use crate::registry::{ConsumerRegistry, RegistryChange, RegistryListener};

/// Reports whether the host is currently in an external takeover context.
pub trait EnvironmentSignal: Send + Sync {
    fn is_takeover(&self) -> bool;
}

impl<F> EnvironmentSignal for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_takeover(&self) -> bool {
        self()
    }
}

/// Settable [`EnvironmentSignal`].
#[derive(Debug, Default)]
pub struct EnvironmentFlag(AtomicBool);

impl EnvironmentFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, takeover: bool) {
        self.0.store(takeover, Ordering::SeqCst);
    }
}

impl EnvironmentSignal for EnvironmentFlag {
    fn is_takeover(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Exclusive ownership of the presentation surface while it is active.
/// Handed back to the surface on stop.
#[derive(Debug, PartialEq, Eq)]
pub struct SurfaceToken(u64);

impl SurfaceToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Local UI/notification that renders transport controls.
pub trait PresentationSurface: Send + Sync {
    fn start(
        &self,
        token: &SurfaceToken,
        descriptor: &PresentationDescriptor,
    ) -> anyhow::Result<()>;
    fn stop(&self, token: SurfaceToken);
    fn update(&self, token: &SurfaceToken, descriptor: &PresentationDescriptor);
}

/// What [`PresentationArbiter::reconcile`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconcile {
    Unchanged,
    Started,
    Stopped,
    BuildFailed,
}

/// Passes through `reconcile` before giving up on a decision that keeps
/// moving under it.
const RECONCILE_ATTEMPTS: usize = 3;

/// `true` when `id` contains any of `patterns` (case-insensitive).
pub fn is_takeover_id(id: &str, patterns: &[String]) -> bool {
    let id = id.to_ascii_lowercase();
    patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && id.contains(pattern.as_str()))
}

pub struct PresentationArbiter {
    registry: Arc<ConsumerRegistry>,
    proxy: ResourceProxy,
    environment: Arc<dyn EnvironmentSignal>,
    surface: Arc<dyn PresentationSurface>,
    patterns: Vec<String>,
    seek_increment_ms: u64,
    active: Mutex<Option<SurfaceToken>>,
    next_token: AtomicU64,
}

impl PresentationArbiter {
    pub fn new(
        registry: Arc<ConsumerRegistry>,
        proxy: ResourceProxy,
        environment: Arc<dyn EnvironmentSignal>,
        surface: Arc<dyn PresentationSurface>,
        patterns: Vec<String>,
        seek_increment_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            proxy,
            environment,
            surface,
            patterns: patterns
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            seek_increment_ms,
            active: Mutex::new(None),
            next_token: AtomicU64::new(1),
        })
    }

    fn active(&self) -> MutexGuard<'_, Option<SurfaceToken>> {
        self.active.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.active().is_some()
    }

    /// Whether `id` would suppress the local surface once connected.
    pub fn classify(&self, id: &str) -> bool {
        is_takeover_id(id, &self.patterns)
    }

    pub fn should_present(&self) -> bool {
        if self.environment.is_takeover() {
            return false;
        }
        !self
            .registry
            .connected()
            .iter()
            .any(|consumer| self.classify(consumer.id()))
    }

    /// Apply the current decision to the surface.
    pub fn reconcile(&self) -> Reconcile {
        for _ in 0..RECONCILE_ATTEMPTS {
            let desired = self.should_present();
            // Snapshot before taking the surface lock: the query may have to wait
            // for the executor, which may itself be reconciling.
            let snapshot = (desired && !self.is_active()).then(|| self.proxy.try_snapshot());

            let mut active = self.active();
            if self.should_present() != desired {
                continue;
            }
            match (active.is_some(), desired) {
                (true, false) => {
                    let Some(token) = active.take() else {
                        continue;
                    };
                    drop(active);
                    self.stop_surface(token);
                    return Reconcile::Stopped;
                }
                (false, true) => {
                    // Another reconcile stopped the surface after our snapshot
                    // decision; read again.
                    let Some(snapshot) = snapshot else {
                        continue;
                    };
                    let started = snapshot.and_then(|snapshot| {
                        let descriptor = self.describe(&snapshot);
                        let token = SurfaceToken(self.next_token.fetch_add(1, Ordering::Relaxed));
                        self.start_surface(&token, &descriptor)?;
                        Ok(token)
                    });
                    return match started {
                        Ok(token) => {
                            tracing::info!(token = token.id(), "presentation surface started");
                            *active = Some(token);
                            drop(active);
                            self.announce(true);
                            Reconcile::Started
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "presentation surface not started");
                            Reconcile::BuildFailed
                        }
                    };
                }
                _ => return Reconcile::Unchanged,
            }
        }
        tracing::debug!("presentation decision kept changing; leaving it to the next trigger");
        Reconcile::Unchanged
    }

    /// Stop the surface whatever the current decision is. Used when the
    /// instance it shows goes away. Returns `false` when already inactive.
    pub fn withdraw(&self) -> bool {
        let Some(token) = self.active().take() else {
            return false;
        };
        self.stop_surface(token);
        true
    }

    fn stop_surface(&self, token: SurfaceToken) {
        let id = token.id();
        let surface = self.surface.clone();
        if catch_unwind(AssertUnwindSafe(move || surface.stop(token))).is_err() {
            tracing::error!(token = id, "presentation surface stop panicked");
        }
        tracing::info!(token = id, "presentation surface stopped");
        self.announce(false);
    }

    fn start_surface(
        &self,
        token: &SurfaceToken,
        descriptor: &PresentationDescriptor,
    ) -> Result<(), HubError> {
        match catch_unwind(AssertUnwindSafe(|| self.surface.start(token, descriptor))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(HubError::PresentationBuild(format!("{err:#}"))),
            Err(_) => Err(HubError::PresentationBuild(
                "presentation surface start panicked".to_string(),
            )),
        }
    }

    /// Push fresh player state to the active surface. Returns `false` when
    /// inactive or the player could not be read.
    pub fn refresh(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let snapshot = match self.proxy.try_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::debug!(error = %err, "presentation refresh skipped");
                return false;
            }
        };
        let descriptor = self.describe(&snapshot);
        let active = self.active();
        let Some(token) = active.as_ref() else {
            return false;
        };
        if catch_unwind(AssertUnwindSafe(|| self.surface.update(token, &descriptor))).is_err() {
            tracing::error!(token = token.id(), "presentation surface update panicked");
            return false;
        }
        true
    }

    /// The environment signal may have flipped.
    pub fn environment_changed(&self) -> Reconcile {
        self.reconcile()
    }

    /// Build the surface descriptor from player state.
    pub fn describe(&self, snapshot: &PlaybackSnapshot) -> PresentationDescriptor {
        let media = snapshot.media.as_ref();
        let title = media
            .and_then(|m| m.title.clone().or_else(|| Some(m.id.clone())))
            .unwrap_or_default();
        let subtitle = media.and_then(|m| m.artist.clone().or_else(|| m.album.clone()));
        let toggle = if snapshot.playing {
            ControlAction::Pause
        } else {
            ControlAction::Play
        };
        PresentationDescriptor {
            title,
            subtitle,
            artwork_url: media.and_then(|m| m.artwork_url.clone()),
            playing: snapshot.playing,
            position_ms: snapshot.position_ms,
            duration_ms: media.and_then(|m| m.duration_ms),
            actions: vec![
                ControlAction::SeekBackward {
                    increment_ms: self.seek_increment_ms,
                },
                toggle,
                ControlAction::SeekForward {
                    increment_ms: self.seek_increment_ms,
                },
                ControlAction::Stop,
            ],
        }
    }

    fn announce(&self, presenting: bool) {
        self.registry
            .for_each_connected(|consumer| consumer.on_presentation_mode_changed(presenting));
    }
}

impl RegistryListener for PresentationArbiter {
    fn on_registry_changed(&self, change: &RegistryChange) {
        tracing::trace!(?change, "reconciling presentation after registry change");
        self.reconcile();
    }
}

impl ResourceListener for PresentationArbiter {
    fn on_resource_event(&self, event: &ResourceEvent) {
        match event {
            ResourceEvent::StateChanged { .. }
            | ResourceEvent::MediaChanged(_)
            | ResourceEvent::SeekCompleted { .. } => {
                self.refresh();
            }
            ResourceEvent::VolumeChanged(_) | ResourceEvent::Error(_) => {}
        }
    }
}

impl LifecycleObserver for PresentationArbiter {
    fn on_ready(&self, _generation: u64) {
        self.reconcile();
    }

    fn on_released(&self, generation: u64) {
        if self.withdraw() {
            tracing::debug!(generation, "presentation surface withdrawn with its instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_TAKEOVER_PATTERNS, HubConfig};
    use crate::executor::AffinityExecutor;
    use crate::lifecycle::InstanceLifecycle;
    use crate::sim::{ConsumerNotice, SimulatedConsumer, SimulatedPlayer, SimulatedPlayerStats};
    use playback_hub_types::MediaRef;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSurface {
        calls: Mutex<Vec<String>>,
        fail_start: AtomicBool,
    }

    impl RecordingSurface {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    impl PresentationSurface for RecordingSurface {
        fn start(
            &self,
            token: &SurfaceToken,
            descriptor: &PresentationDescriptor,
        ) -> anyhow::Result<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                anyhow::bail!("artwork decode failed");
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("start:{}:{}", token.id(), descriptor.title));
            Ok(())
        }

        fn stop(&self, token: SurfaceToken) {
            self.calls.lock().unwrap().push(format!("stop:{}", token.id()));
        }

        fn update(&self, token: &SurfaceToken, descriptor: &PresentationDescriptor) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("update:{}:{}", token.id(), descriptor.title));
        }
    }

    struct Rig {
        lifecycle: Arc<InstanceLifecycle>,
        registry: Arc<ConsumerRegistry>,
        arbiter: Arc<PresentationArbiter>,
        surface: Arc<RecordingSurface>,
        environment: Arc<EnvironmentFlag>,
    }

    fn rig() -> Rig {
        let executor = Arc::new(AffinityExecutor::spawn("test-arbiter").unwrap());
        let config = HubConfig {
            call_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            ..HubConfig::default()
        };
        let stats = SimulatedPlayerStats::shared();
        let lifecycle = InstanceLifecycle::new(executor, SimulatedPlayer::factory(stats), &config);
        let registry = ConsumerRegistry::new();
        lifecycle.add_observer(registry.clone());
        let surface = Arc::new(RecordingSurface::default());
        let environment = EnvironmentFlag::new();
        let arbiter = PresentationArbiter::new(
            registry.clone(),
            lifecycle.live_proxy(),
            environment.clone(),
            surface.clone(),
            config.takeover_patterns.clone(),
            config.seek_increment_ms,
        );
        registry.add_listener(arbiter.clone());
        lifecycle.add_resource_listener(arbiter.clone());
        lifecycle.add_observer(arbiter.clone());
        Rig {
            lifecycle,
            registry,
            arbiter,
            surface,
            environment,
        }
    }

    #[test]
    fn classifies_takeover_ids() {
        let patterns: Vec<String> = DEFAULT_TAKEOVER_PATTERNS.iter().map(|p| p.to_string()).collect();
        assert!(is_takeover_id("auto.headunit-1", &patterns));
        assert!(is_takeover_id("com.google.Android.Auto", &patterns));
        assert!(is_takeover_id("vendor.automotive.hu", &patterns));
        assert!(is_takeover_id("car.display", &patterns));
        assert!(!is_takeover_id("watch.face", &patterns));
        assert!(!is_takeover_id("autoplay-widget", &patterns));
    }

    #[test]
    fn headunit_connection_stops_active_surface_once() {
        let rig = rig();
        drop(rig.lifecycle.get_or_create().unwrap());
        assert!(rig.arbiter.is_active());
        assert!(rig.arbiter.should_present());

        let bystander = SimulatedConsumer::new("watch.face");
        rig.registry.register(bystander.clone()).unwrap();
        rig.registry
            .register(SimulatedConsumer::new("auto.headunit-1"))
            .unwrap();

        assert!(!rig.arbiter.should_present());
        assert!(!rig.arbiter.is_active());
        assert_eq!(rig.arbiter.reconcile(), Reconcile::Unchanged);
        assert_eq!(rig.surface.count("stop:"), 1);
        assert_eq!(bystander.count(&ConsumerNotice::Presentation(false)), 1);

        rig.registry.unregister("auto.headunit-1");
        assert!(rig.arbiter.is_active());
        assert_eq!(rig.surface.count("start:"), 2);
        assert_eq!(bystander.count(&ConsumerNotice::Presentation(true)), 1);
    }

    #[test]
    fn environment_takeover_suppresses_surface() {
        let rig = rig();
        drop(rig.lifecycle.get_or_create().unwrap());
        assert!(rig.arbiter.is_active());

        rig.environment.set(true);
        assert_eq!(rig.arbiter.environment_changed(), Reconcile::Stopped);
        assert_eq!(rig.arbiter.environment_changed(), Reconcile::Unchanged);
        rig.environment.set(false);
        assert_eq!(rig.arbiter.environment_changed(), Reconcile::Started);
    }

    #[test]
    fn release_withdraws_surface_and_recreate_starts_fresh() {
        let rig = rig();
        let watch = SimulatedConsumer::new("watch.face");
        rig.registry.register(watch.clone()).unwrap();
        drop(rig.lifecycle.get_or_create().unwrap());
        assert_eq!(rig.surface.count("start:1"), 1);

        assert!(rig.lifecycle.release());
        assert!(!rig.arbiter.is_active());
        assert_eq!(rig.surface.count("stop:1"), 1);
        assert_eq!(rig.arbiter.reconcile(), Reconcile::BuildFailed);
        assert!(!rig.arbiter.withdraw());

        drop(rig.lifecycle.get_or_create().unwrap());
        assert!(rig.arbiter.is_active());
        assert_eq!(rig.surface.count("start:2"), 1);
        assert_eq!(watch.count(&ConsumerNotice::Presentation(true)), 2);
    }

    #[test]
    fn concurrent_reconciles_start_surface_once() {
        let rig = rig();
        drop(rig.lifecycle.get_or_create().unwrap());
        rig.environment.set(true);
        assert_eq!(rig.arbiter.reconcile(), Reconcile::Stopped);
        rig.environment.set(false);

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let outcomes: Vec<Reconcile> = (0..8)
            .map(|_| {
                let arbiter = rig.arbiter.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    arbiter.reconcile()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        assert_eq!(outcomes.iter().filter(|o| **o == Reconcile::Started).count(), 1);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Reconcile::Started | Reconcile::Unchanged)));
        assert!(rig.arbiter.is_active());
        assert_eq!(rig.surface.count("start:"), 2);
    }

    #[test]
    fn closure_signal_is_accepted() {
        let signal: Arc<dyn EnvironmentSignal> = Arc::new(|| true);
        assert!(signal.is_takeover());
    }

    #[test]
    fn build_failure_leaves_arbiter_inactive() {
        let rig = rig();
        assert_eq!(rig.arbiter.reconcile(), Reconcile::BuildFailed);

        rig.surface.fail_start.store(true, Ordering::SeqCst);
        drop(rig.lifecycle.get_or_create().unwrap());
        assert!(!rig.arbiter.is_active());
        assert_eq!(rig.arbiter.reconcile(), Reconcile::BuildFailed);

        rig.surface.fail_start.store(false, Ordering::SeqCst);
        assert_eq!(rig.arbiter.reconcile(), Reconcile::Started);
        assert_eq!(rig.surface.count("start:"), 1);
    }

    #[test]
    fn state_changes_refresh_active_surface() {
        let rig = rig();
        let handle = rig.lifecycle.get_or_create().unwrap();
        let proxy = handle.try_proxy().unwrap();
        proxy.set_media(Some(MediaRef::new("ep-9").with_title("Episode 9")));
        proxy.play();
        let _ = proxy.is_playing();

        assert!(rig.surface.calls().contains(&"update:1:Episode 9".to_string()));
        let descriptor = rig.arbiter.describe(&proxy.snapshot());
        assert!(descriptor.playing);
        assert_eq!(descriptor.actions[1], ControlAction::Pause);
        assert_eq!(
            descriptor.actions[2],
            ControlAction::SeekForward {
                increment_ms: 10_000
            }
        );
    }
}
