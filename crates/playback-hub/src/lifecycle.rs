//! Instance lifecycle.
//!
//! `Uncreated -> Creating -> Ready -> Released`, then a fresh `Creating` cycle
//! may follow. Transitions happen under one mutex; callers waiting for the
//! instance park on the paired condition variable. Construction and teardown
//! always run on the affinity executor.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::call_bridge::BlockingCallBridge;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::events::ResourceListener;
use crate::executor::{AffinityExecutor, Task};
use crate::proxy::ResourceProxy;
use crate::resource::{ResourceFactory, ResourceHost};

const RESOLVE_POLL: Duration = Duration::from_millis(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uncreated,
    Creating,
    Ready,
    Released,
}

/// Told about instance transitions, on the executor.
pub trait LifecycleObserver: Send + Sync {
    fn on_ready(&self, _generation: u64) {}
    fn on_released(&self, _generation: u64) {}
}

/// Cooperative cancellation for [`BindingHandle::resolve`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Inner {
    state: LifecycleState,
    generation: u64,
    pending: Vec<Task>,
    last_failure: Option<(u64, String)>,
}

/// Owns the creation and teardown of the single player instance.
pub struct InstanceLifecycle {
    host: Arc<ResourceHost>,
    factory: ResourceFactory,
    call_bridge: BlockingCallBridge,
    ready_bridge: BlockingCallBridge,
    ready_timeout: Duration,
    seek_increment_ms: u64,
    trace_calls: bool,
    inner: Mutex<Inner>,
    ready: Condvar,
    observers: Mutex<Vec<Arc<dyn LifecycleObserver>>>,
    binds: AtomicUsize,
}

impl InstanceLifecycle {
    pub fn new(
        executor: Arc<AffinityExecutor>,
        factory: ResourceFactory,
        config: &HubConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            host: ResourceHost::new(executor.clone()),
            factory,
            call_bridge: BlockingCallBridge::new(executor.clone(), config.call_timeout),
            ready_bridge: BlockingCallBridge::new(executor, config.ready_timeout),
            ready_timeout: config.ready_timeout,
            seek_increment_ms: config.seek_increment_ms,
            trace_calls: config.trace_calls,
            inner: Mutex::new(Inner {
                state: LifecycleState::Uncreated,
                generation: 0,
                pending: Vec::new(),
                last_failure: None,
            }),
            ready: Condvar::new(),
            observers: Mutex::new(Vec::new()),
            binds: AtomicUsize::new(0),
        })
    }

    pub(crate) fn host(&self) -> &Arc<ResourceHost> {
        &self.host
    }

    pub fn executor(&self) -> &Arc<AffinityExecutor> {
        self.host.executor()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// Generation of the ready instance.
    pub fn generation(&self) -> Option<u64> {
        let inner = self.lock();
        (inner.state == LifecycleState::Ready).then_some(inner.generation)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Live binding handles.
    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(observer);
    }

    /// Subscribe to events emitted by every instance this lifecycle builds.
    pub fn add_resource_listener(&self, listener: Arc<dyn ResourceListener>) {
        self.host.events().add_listener(listener);
    }

    /// Drop every observer and resource listener.
    pub fn clear_listeners(&self) {
        self.observers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
        self.host.events().clear_listeners();
    }

    /// Proxy pinned to `generation`.
    pub(crate) fn proxy_for(&self, generation: Option<u64>) -> ResourceProxy {
        ResourceProxy::new(
            self.host.clone(),
            self.call_bridge.clone(),
            generation,
            self.seek_increment_ms,
            self.trace_calls,
        )
    }

    /// Proxy that follows whichever instance is live.
    pub fn live_proxy(&self) -> ResourceProxy {
        self.proxy_for(None)
    }

    /// Attach without triggering construction.
    pub fn bind(self: &Arc<Self>) -> BindingHandle {
        self.binds.fetch_add(1, Ordering::SeqCst);
        BindingHandle {
            lifecycle: self.clone(),
        }
    }

    /// Return a binding to the ready instance, constructing it on first use.
    pub fn get_or_create(self: &Arc<Self>) -> HubResult<BindingHandle> {
        let deadline = Instant::now() + self.ready_timeout;
        let mut inner = self.lock();
        loop {
            match inner.state {
                LifecycleState::Ready => {
                    drop(inner);
                    return Ok(self.bind());
                }
                LifecycleState::Uncreated | LifecycleState::Released => {
                    inner.state = LifecycleState::Creating;
                    inner.generation += 1;
                    let generation = inner.generation;
                    drop(inner);
                    tracing::debug!(generation, "creating playback resource");
                    self.construct(generation)?;
                    return Ok(self.bind());
                }
                LifecycleState::Creating => {
                    if self.executor().is_current() {
                        // The construction task is queued behind us; build in place.
                        let generation = inner.generation;
                        drop(inner);
                        self.build_local(generation).map_err(HubError::ConstructionFailed)?;
                        return Ok(self.bind());
                    }
                    let waiting_on = inner.generation;
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(
                            timeout_ms = self.ready_timeout.as_millis() as u64,
                            "timed out waiting for playback resource"
                        );
                        return Err(HubError::DispatchTimeout {
                            timeout: self.ready_timeout,
                        });
                    }
                    inner = self
                        .ready
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|err| err.into_inner())
                        .0;
                    if inner.state == LifecycleState::Uncreated {
                        if let Some((failed, reason)) = &inner.last_failure {
                            if *failed == waiting_on {
                                return Err(HubError::ConstructionFailed(reason.clone()));
                            }
                        }
                    }
                }
            }
        }
    }

    fn construct(self: &Arc<Self>, generation: u64) -> HubResult<()> {
        let this = self.clone();
        match self
            .ready_bridge
            .invoke(move || this.build_local(generation))
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(HubError::ConstructionFailed(reason)),
            Err(HubError::ExecutorUnavailable) => {
                self.abandon(generation, "executor unavailable".to_string());
                Err(HubError::ExecutorUnavailable)
            }
            Err(err) => Err(err),
        }
    }

    /// Build and install the instance for `generation`. Executor only.
    fn build_local(&self, generation: u64) -> Result<(), String> {
        {
            let inner = self.lock();
            if inner.generation != generation {
                return Err("superseded by a newer instance".to_string());
            }
            match inner.state {
                LifecycleState::Creating => {}
                LifecycleState::Ready => return Ok(()),
                _ => return Err("construction abandoned".to_string()),
            }
        }

        let built = catch_unwind(AssertUnwindSafe(|| (self.factory)(self.host.sink())));
        let resource = match built {
            Ok(Ok(resource)) => resource,
            Ok(Err(err)) => {
                let reason = format!("{err:#}");
                self.abandon(generation, reason.clone());
                return Err(reason);
            }
            Err(_) => {
                let reason = "resource factory panicked".to_string();
                self.abandon(generation, reason.clone());
                return Err(reason);
            }
        };
        self.host.install(generation, resource);

        let pending = {
            let mut inner = self.lock();
            inner.state = LifecycleState::Ready;
            inner.last_failure = None;
            self.ready.notify_all();
            std::mem::take(&mut inner.pending)
        };
        tracing::debug!(generation, pending = pending.len(), "playback resource ready");
        for task in pending {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!(generation, "pending task panicked");
            }
        }
        self.notify(|observer| observer.on_ready(generation));
        Ok(())
    }

    fn abandon(&self, generation: u64, reason: String) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == LifecycleState::Creating {
            tracing::warn!(generation, reason = %reason, "playback resource construction failed");
            inner.state = LifecycleState::Uncreated;
            inner.last_failure = Some((generation, reason));
            self.ready.notify_all();
        }
    }

    /// Run `task` on the executor once the instance is ready. Tasks queued
    /// before readiness run in insertion order right after construction.
    pub fn add_pending_task(&self, task: Task) -> HubResult<()> {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Ready {
            drop(inner);
            return self.executor().submit(task);
        }
        inner.pending.push(task);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Tear down the ready instance. Returns `false` when nothing was ready.
    ///
    /// Waits (bounded by the call timeout) for the teardown to finish on the
    /// executor unless called from it.
    pub fn release(self: &Arc<Self>) -> bool {
        let generation = {
            let mut inner = self.lock();
            if inner.state != LifecycleState::Ready {
                return false;
            }
            inner.state = LifecycleState::Released;
            inner.generation
        };
        tracing::debug!(generation, "releasing playback resource");
        let this = self.clone();
        let teardown = move || {
            this.host.release();
            this.notify(|observer| observer.on_released(generation));
        };
        if let Err(err) = self.call_bridge.invoke(teardown) {
            tracing::warn!(generation, error = %err, "playback resource teardown not confirmed");
        }
        true
    }

    fn notify(&self, f: impl Fn(&dyn LifecycleObserver)) {
        let observers: Vec<Arc<dyn LifecycleObserver>> = self
            .observers
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                tracing::error!("lifecycle observer panicked");
            }
        }
    }
}

/// One caller's attachment to the lifecycle. Dropping it unbinds.
pub struct BindingHandle {
    lifecycle: Arc<InstanceLifecycle>,
}

impl BindingHandle {
    /// Proxy pinned to the ready instance, if there is one.
    pub fn try_proxy(&self) -> Option<ResourceProxy> {
        self.lifecycle
            .generation()
            .map(|generation| self.lifecycle.proxy_for(Some(generation)))
    }

    /// Block until an instance is ready or `cancel` fires.
    pub fn resolve(&self, cancel: &CancelToken) -> HubResult<ResourceProxy> {
        let mut inner = self.lifecycle.lock();
        loop {
            if inner.state == LifecycleState::Ready {
                let generation = inner.generation;
                drop(inner);
                return Ok(self.lifecycle.proxy_for(Some(generation)));
            }
            if cancel.is_cancelled() {
                return Err(HubError::Cancelled);
            }
            inner = self
                .lifecycle
                .ready
                .wait_timeout(inner, RESOLVE_POLL)
                .unwrap_or_else(|err| err.into_inner())
                .0;
        }
    }
}

impl Drop for BindingHandle {
    fn drop(&mut self) {
        self.lifecycle.binds.fetch_sub(1, Ordering::SeqCst);
    }
}
