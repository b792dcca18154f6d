//! Throttled sync broker.
//!
//! Inbound: consumers submit [`SyncUpdate`]s which are rate limited by one
//! hub-wide window and applied on the executor field by field, skipping
//! fields that already hold the requested value.
//! Outbound: player events fan out to every connected consumer, unthrottled.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use playback_hub_types::{
    MediaRef, SyncField, SyncUpdate, SyncValue, sync_state_from_snapshot,
};

use crate::events::{ResourceEvent, ResourceListener};
use crate::lifecycle::InstanceLifecycle;
use crate::registry::ConsumerRegistry;
use crate::resource::PlaybackResource;

/// Monotonic time source for the throttle window.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock for tests and scripted demos.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|err| err.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Result of [`SyncBroker::sync_from`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Queued for application on the executor.
    Accepted,
    /// Inside the throttle window; nothing applied.
    Throttled,
    /// No ready instance; nothing applied.
    Unavailable,
}

// Media first: loading an item resets the position.
const APPLY_ORDER: [SyncField; 5] = [
    SyncField::MediaIdentity,
    SyncField::Paused,
    SyncField::SeekPosition,
    SyncField::PlaybackSpeed,
    SyncField::VolumeLevel,
];

pub struct SyncBroker {
    lifecycle: Arc<InstanceLifecycle>,
    registry: Arc<ConsumerRegistry>,
    clock: Arc<dyn Clock>,
    throttle: Duration,
    last_accepted: Mutex<Option<Duration>>,
}

impl SyncBroker {
    pub fn new(
        lifecycle: Arc<InstanceLifecycle>,
        registry: Arc<ConsumerRegistry>,
        clock: Arc<dyn Clock>,
        throttle: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            registry,
            clock,
            throttle,
            last_accepted: Mutex::new(None),
        })
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Apply `updates` requested by `source`.
    ///
    /// The window is shared by every source: a sync accepted from one consumer
    /// throttles all of them.
    pub fn sync_from(&self, source: &str, updates: SyncUpdate) -> SyncOutcome {
        let now = self.clock.now();
        let mut last = self.last_accepted.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(previous) = *last {
            if now < previous + self.throttle {
                tracing::debug!(source, "sync throttled");
                return SyncOutcome::Throttled;
            }
        }
        let Some(generation) = self.lifecycle.generation() else {
            tracing::debug!(source, "sync ignored: no playback resource");
            return SyncOutcome::Unavailable;
        };

        let host = self.lifecycle.host().clone();
        let origin = source.to_string();
        let submitted = self.lifecycle.executor().submit(Box::new(move || {
            let applied = host.with_local(Some(generation), |resource| {
                apply_updates(resource, &updates, &origin)
            });
            if let Err(err) = applied {
                tracing::warn!(source = %origin, error = %err, "sync dropped");
            }
        }));
        if submitted.is_err() {
            return SyncOutcome::Unavailable;
        }
        *last = Some(now);
        SyncOutcome::Accepted
    }

    /// Every field as currently reported by the player.
    pub fn current_state(&self) -> SyncUpdate {
        sync_state_from_snapshot(&self.lifecycle.live_proxy().snapshot())
    }

    /// Inbound handle for consumer `consumer_id`.
    pub fn port(self: &Arc<Self>, consumer_id: impl Into<String>) -> ConsumerPort {
        ConsumerPort {
            broker: self.clone(),
            consumer_id: consumer_id.into(),
        }
    }
}

fn same_value(current: &SyncValue, requested: &SyncValue) -> bool {
    match (current, requested) {
        (SyncValue::Float(a), SyncValue::Float(b)) => (a - b).abs() <= f32::EPSILON,
        (SyncValue::Media(a), SyncValue::Media(b)) => {
            a.as_ref().map(|m| &m.id) == b.as_ref().map(|m| &m.id)
        }
        _ => current == requested,
    }
}

/// Apply each present field that differs from the current value. Executor only.
fn apply_updates(resource: &mut dyn PlaybackResource, updates: &SyncUpdate, source: &str) -> usize {
    let mut applied = 0;
    for field in APPLY_ORDER {
        let Some(requested) = updates.get(&field) else {
            continue;
        };
        if requested.kind() != field.kind() {
            tracing::warn!(source, ?field, value = ?requested, "sync value has wrong type; skipped");
            continue;
        }
        let requested = match (field, requested) {
            (SyncField::VolumeLevel, SyncValue::Float(v)) => SyncValue::Float(v.clamp(0.0, 1.0)),
            _ => requested.clone(),
        };
        if same_value(&field.read(&resource.snapshot()), &requested) {
            continue;
        }
        match (field, requested) {
            (SyncField::Paused, SyncValue::Bool(paused)) => resource.set_play_when_ready(!paused),
            (SyncField::SeekPosition, SyncValue::Millis(ms)) => resource.seek_to(ms),
            (SyncField::PlaybackSpeed, SyncValue::Float(speed)) => resource.set_speed(speed),
            (SyncField::VolumeLevel, SyncValue::Float(volume)) => resource.set_volume(volume),
            (SyncField::MediaIdentity, SyncValue::Media(media)) => resource.set_media(media),
            _ => continue,
        }
        applied += 1;
    }
    tracing::debug!(source, requested = updates.len(), applied, "sync applied");
    applied
}

impl ResourceListener for SyncBroker {
    fn on_resource_event(&self, event: &ResourceEvent) {
        match event {
            ResourceEvent::StateChanged {
                playing,
                position_ms,
                speed,
            } => self
                .registry
                .for_each_connected(|c| c.on_state_changed(*playing, *position_ms, *speed)),
            ResourceEvent::MediaChanged(media) => self
                .registry
                .for_each_connected(|c| c.on_media_changed(media.as_ref())),
            ResourceEvent::SeekCompleted { position_ms } => self
                .registry
                .for_each_connected(|c| c.on_seek_completed(*position_ms)),
            ResourceEvent::VolumeChanged(volume) => self
                .registry
                .for_each_connected(|c| c.on_volume_changed(*volume)),
            ResourceEvent::Error(error) => {
                tracing::debug!(code = %error.code, "player error not forwarded to consumers");
            }
        }
    }
}

/// A consumer's inbound control handle. Every request goes through
/// [`SyncBroker::sync_from`] and reports whether it was accepted.
#[derive(Clone)]
pub struct ConsumerPort {
    broker: Arc<SyncBroker>,
    consumer_id: String,
}

impl ConsumerPort {
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn request(&self, field: SyncField, value: SyncValue) -> bool {
        let updates = SyncUpdate::from([(field, value)]);
        self.broker.sync_from(&self.consumer_id, updates) == SyncOutcome::Accepted
    }

    pub fn request_playback_change(&self, playing: bool) -> bool {
        self.request(SyncField::Paused, SyncValue::Bool(!playing))
    }

    pub fn request_seek(&self, position_ms: u64) -> bool {
        self.request(SyncField::SeekPosition, SyncValue::Millis(position_ms))
    }

    pub fn request_speed_change(&self, speed: f32) -> bool {
        self.request(SyncField::PlaybackSpeed, SyncValue::Float(speed))
    }

    pub fn request_volume_change(&self, volume: f32) -> bool {
        self.request(SyncField::VolumeLevel, SyncValue::Float(volume))
    }

    pub fn request_media_change(&self, media: Option<MediaRef>) -> bool {
        self.request(SyncField::MediaIdentity, SyncValue::Media(media))
    }
}
