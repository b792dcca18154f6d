//! Resource event fan-out.
//!
//! The player emits [`ResourceEvent`]s through an [`EventSink`]. Events are
//! queued and delivered on the executor after the emitting operation returns,
//! so listeners never run while the resource is borrowed and may call back
//! into the proxy.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use playback_hub_types::{MediaRef, PlaybackError};

use crate::executor::AffinityExecutor;

/// State transitions reported by the player resource.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceEvent {
    StateChanged {
        playing: bool,
        position_ms: u64,
        speed: f32,
    },
    MediaChanged(Option<MediaRef>),
    SeekCompleted {
        position_ms: u64,
    },
    VolumeChanged(f32),
    Error(PlaybackError),
}

/// Receives resource events on the executor thread.
pub trait ResourceListener: Send + Sync {
    fn on_resource_event(&self, event: &ResourceEvent);
}

/// Queue + listener list shared by the sink and the resource host.
pub(crate) struct EventHub {
    executor: Arc<AffinityExecutor>,
    queue: Mutex<VecDeque<ResourceEvent>>,
    listeners: Mutex<Vec<Arc<dyn ResourceListener>>>,
    draining: AtomicBool,
}

impl EventHub {
    pub(crate) fn new(executor: Arc<AffinityExecutor>) -> Arc<Self> {
        Arc::new(Self {
            executor,
            queue: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
        })
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn ResourceListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(listener);
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn push(self: &Arc<Self>, event: ResourceEvent) {
        self.queue
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push_back(event);
        if !self.executor.is_current() {
            let hub = self.clone();
            if self.executor.submit(Box::new(move || hub.drain())).is_err() {
                tracing::warn!("dropping resource event: executor stopped");
            }
        }
    }

    /// Deliver queued events. Nested calls return immediately; the outer loop
    /// picks up anything emitted by listeners.
    pub(crate) fn drain(&self) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let next = self
                .queue
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .pop_front();
            let Some(event) = next else {
                break;
            };
            self.fan_out(&event);
        }
        self.draining.store(false, Ordering::Release);
    }

    fn fan_out(&self, event: &ResourceEvent) {
        let listeners: Vec<Arc<dyn ResourceListener>> = self
            .listeners
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_resource_event(event))).is_err() {
                tracing::error!(?event, "resource listener panicked");
            }
        }
    }
}

/// Handle given to the resource factory for reporting state transitions.
#[derive(Clone)]
pub struct EventSink {
    hub: Arc<EventHub>,
}

impl EventSink {
    pub(crate) fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }

    /// Queue an event for delivery on the executor.
    pub fn emit(&self, event: ResourceEvent) {
        self.hub.push(event);
    }
}
