//! Composition root wiring the executor, lifecycle, registry, broker and
//! arbiter together.

use std::sync::Arc;

use playback_hub_types::{RegistryStats, SyncUpdate};

use crate::arbiter::{EnvironmentSignal, PresentationArbiter, PresentationSurface};
use crate::broker::{Clock, ConsumerPort, SyncBroker, SyncOutcome, SystemClock};
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::executor::AffinityExecutor;
use crate::lifecycle::{BindingHandle, InstanceLifecycle};
use crate::proxy::ResourceProxy;
use crate::registry::{Consumer, ConsumerRegistry};
use crate::resource::ResourceFactory;

pub struct PlaybackHubBuilder {
    config: HubConfig,
    factory: ResourceFactory,
    surface: Option<Arc<dyn PresentationSurface>>,
    environment: Option<Arc<dyn EnvironmentSignal>>,
    clock: Option<Arc<dyn Clock>>,
}

impl PlaybackHubBuilder {
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables the presentation arbiter.
    pub fn surface(mut self, surface: Arc<dyn PresentationSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn EnvironmentSignal>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> HubResult<PlaybackHub> {
        let config = self.config;
        let executor = Arc::new(AffinityExecutor::spawn(&config.executor_name)?);
        let lifecycle = InstanceLifecycle::new(executor.clone(), self.factory, &config);
        let registry = ConsumerRegistry::new();
        lifecycle.add_observer(registry.clone());

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let broker = SyncBroker::new(
            lifecycle.clone(),
            registry.clone(),
            clock,
            config.sync_throttle,
        );
        lifecycle.add_resource_listener(broker.clone());

        let arbiter = self.surface.map(|surface| {
            let environment = self
                .environment
                .unwrap_or_else(|| Arc::new(|| false) as Arc<dyn EnvironmentSignal>);
            let arbiter = PresentationArbiter::new(
                registry.clone(),
                lifecycle.live_proxy(),
                environment,
                surface,
                config.takeover_patterns.clone(),
                config.seek_increment_ms,
            );
            registry.add_listener(arbiter.clone());
            lifecycle.add_resource_listener(arbiter.clone());
            lifecycle.add_observer(arbiter.clone());
            arbiter
        });

        tracing::info!(
            executor = %config.executor_name,
            call_timeout_ms = config.call_timeout.as_millis() as u64,
            sync_throttle_ms = config.sync_throttle.as_millis() as u64,
            presentation = arbiter.is_some(),
            resource_listeners = lifecycle.host().events().listener_count(),
            "playback hub ready"
        );
        Ok(PlaybackHub {
            config,
            executor,
            lifecycle,
            registry,
            broker,
            arbiter,
        })
    }
}

/// Owns every hub component. Dropping it shuts the hub down.
pub struct PlaybackHub {
    config: HubConfig,
    executor: Arc<AffinityExecutor>,
    lifecycle: Arc<InstanceLifecycle>,
    registry: Arc<ConsumerRegistry>,
    broker: Arc<SyncBroker>,
    arbiter: Option<Arc<PresentationArbiter>>,
}

impl PlaybackHub {
    pub fn builder(factory: ResourceFactory) -> PlaybackHubBuilder {
        PlaybackHubBuilder {
            config: HubConfig::default(),
            factory,
            surface: None,
            environment: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<InstanceLifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<SyncBroker> {
        &self.broker
    }

    pub fn arbiter(&self) -> Option<&Arc<PresentationArbiter>> {
        self.arbiter.as_ref()
    }

    pub fn get_or_create(&self) -> HubResult<BindingHandle> {
        self.lifecycle.get_or_create()
    }

    pub fn bind(&self) -> BindingHandle {
        self.lifecycle.bind()
    }

    /// Proxy following whichever instance is live.
    pub fn proxy(&self) -> ResourceProxy {
        self.lifecycle.live_proxy()
    }

    /// Register `consumer` and hand back its inbound port.
    pub fn register_consumer(&self, consumer: Arc<dyn Consumer>) -> HubResult<ConsumerPort> {
        let id = consumer.id().trim().to_string();
        self.registry.register(consumer)?;
        Ok(self.broker.port(id))
    }

    pub fn unregister_consumer(&self, id: &str) -> bool {
        self.registry.unregister(id)
    }

    pub fn sync_from(&self, source: &str, updates: SyncUpdate) -> SyncOutcome {
        self.broker.sync_from(source, updates)
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn release(&self) -> bool {
        self.lifecycle.release()
    }

    /// Disconnect consumers, release the instance, take down the surface and
    /// stop the executor. Listener lists are emptied on the way so the
    /// components can be dropped.
    pub fn shutdown(&self) {
        if !self.executor.is_running() {
            return;
        }
        self.registry.clear_all();
        self.lifecycle.release();
        if let Some(arbiter) = &self.arbiter {
            arbiter.withdraw();
        }
        self.lifecycle.clear_listeners();
        self.executor.shutdown();
        tracing::info!("playback hub stopped");
    }
}

impl Drop for PlaybackHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{EnvironmentFlag, SurfaceToken};
    use crate::broker::ManualClock;
    use crate::error::HubError;
    use crate::lifecycle::LifecycleState;
    use crate::sim::{ConsumerNotice, SimulatedConsumer, SimulatedPlayer, SimulatedPlayerStats};
    use playback_hub_types::{MediaRef, PresentationDescriptor};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSurface {
        active: Mutex<Option<u64>>,
        updates: AtomicUsize,
    }

    impl PresentationSurface for CountingSurface {
        fn start(
            &self,
            token: &SurfaceToken,
            _descriptor: &PresentationDescriptor,
        ) -> anyhow::Result<()> {
            *self.active.lock().unwrap() = Some(token.id());
            Ok(())
        }

        fn stop(&self, _token: SurfaceToken) {
            *self.active.lock().unwrap() = None;
        }

        fn update(&self, _token: &SurfaceToken, _descriptor: &PresentationDescriptor) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config() -> HubConfig {
        HubConfig {
            executor_name: "test-hub".to_string(),
            call_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            ..HubConfig::default()
        }
    }

    #[test]
    fn end_to_end_session() {
        let stats = SimulatedPlayerStats::shared();
        let surface = Arc::new(CountingSurface::default());
        let clock = ManualClock::new();
        let hub = PlaybackHub::builder(SimulatedPlayer::factory(stats.clone()))
            .config(test_config())
            .surface(surface.clone())
            .environment(EnvironmentFlag::new())
            .clock(clock.clone())
            .build()
            .unwrap();

        let watch = SimulatedConsumer::new("watch.face");
        let port = hub.register_consumer(watch.clone()).unwrap();
        assert!(!watch.is_connected());
        assert!(!port.request_playback_change(true));

        let handle = hub.get_or_create().unwrap();
        let proxy = handle.try_proxy().unwrap();
        assert!(watch.is_connected());
        assert_eq!(*surface.active.lock().unwrap(), Some(1));

        proxy.set_media(Some(MediaRef::new("track-1").with_duration_ms(60_000)));
        assert!(port.request_playback_change(true));
        clock.advance(hub.config().sync_throttle);
        assert!(port.request_seek(12_000));
        assert!(proxy.is_playing());
        assert_eq!(proxy.position_ms(), 12_000);
        assert!(watch.count(&ConsumerNotice::Seek(12_000)) >= 1);
        assert!(surface.updates.load(Ordering::SeqCst) > 0);

        let car = SimulatedConsumer::new("car.dash");
        hub.register_consumer(car).unwrap();
        assert_eq!(*surface.active.lock().unwrap(), None);
        assert_eq!(hub.stats().connected, 2);

        assert!(hub.release());
        assert_eq!(hub.stats().connected, 0);
        assert_eq!(SimulatedPlayerStats::count(&stats.foreign_mutations), 0);
    }

    #[test]
    fn command_after_release_is_a_safe_no_op() {
        let stats = SimulatedPlayerStats::shared();
        let hub = PlaybackHub::builder(SimulatedPlayer::factory(stats.clone()))
            .config(test_config())
            .build()
            .unwrap();
        let proxy = hub.get_or_create().unwrap().try_proxy().unwrap();
        assert!(hub.release());

        proxy.play();
        hub.proxy().seek_forward();
        assert!(!proxy.is_playing());
        assert_eq!(hub.lifecycle().state(), LifecycleState::Released);
        assert_eq!(SimulatedPlayerStats::count(&stats.constructed), 1);
        assert!(matches!(
            hub.proxy().try_snapshot(),
            Err(HubError::ResourceUnavailable)
        ));
    }

    #[test]
    fn shutdown_stops_surface_and_frees_components() {
        let stats = SimulatedPlayerStats::shared();
        let surface = Arc::new(CountingSurface::default());
        let hub = PlaybackHub::builder(SimulatedPlayer::factory(stats.clone()))
            .config(test_config())
            .surface(surface.clone())
            .build()
            .unwrap();
        hub.register_consumer(SimulatedConsumer::new("watch.face"))
            .unwrap();
        drop(hub.get_or_create().unwrap());
        assert_eq!(*surface.active.lock().unwrap(), Some(1));

        let lifecycle = Arc::downgrade(hub.lifecycle());
        let registry = Arc::downgrade(hub.registry());
        let broker = Arc::downgrade(hub.broker());
        let arbiter = hub.arbiter().map(Arc::downgrade).unwrap();

        hub.shutdown();
        assert_eq!(*surface.active.lock().unwrap(), None);
        assert!(!arbiter.upgrade().unwrap().is_active());

        drop(hub);
        assert!(lifecycle.upgrade().is_none());
        assert!(registry.upgrade().is_none());
        assert!(broker.upgrade().is_none());
        assert!(arbiter.upgrade().is_none());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let stats = SimulatedPlayerStats::shared();
        let hub = PlaybackHub::builder(SimulatedPlayer::factory(stats.clone()))
            .config(test_config())
            .build()
            .unwrap();
        hub.register_consumer(SimulatedConsumer::new("remote")).unwrap();
        drop(hub.get_or_create().unwrap());

        hub.shutdown();
        hub.shutdown();
        assert_eq!(hub.stats().registered, 0);
        assert_eq!(SimulatedPlayerStats::count(&stats.released), 1);
        assert!(matches!(
            hub.get_or_create(),
            Err(HubError::ExecutorUnavailable)
        ));
    }
}
