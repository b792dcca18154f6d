//! Player resource surface and the executor-owned slot holding it.

use std::sync::{Arc, Mutex};

use playback_hub_types::{MediaRef, PlaybackError, PlaybackSnapshot, PlaybackState, RepeatMode};

use crate::error::{HubError, HubResult};
use crate::events::{EventHub, EventSink};
use crate::executor::AffinityExecutor;

/// Operation surface of the thread-confined player.
///
/// Implementations are only ever called on the affinity executor. State
/// transitions should be reported through the [`EventSink`] handed to the
/// factory.
pub trait PlaybackResource: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn set_play_when_ready(&mut self, play_when_ready: bool);
    fn seek_to(&mut self, position_ms: u64);
    fn set_speed(&mut self, speed: f32);
    fn set_volume(&mut self, volume: f32);
    fn set_media(&mut self, media: Option<MediaRef>);
    fn stop(&mut self);

    fn is_playing(&self) -> bool;
    fn play_when_ready(&self) -> bool;
    fn position_ms(&self) -> u64;
    fn speed(&self) -> f32;
    fn volume(&self) -> f32;
    fn media(&self) -> Option<MediaRef>;
    fn error(&self) -> Option<PlaybackError>;

    // Queue navigation. Engines without a queue keep the defaults.
    fn set_repeat_mode(&mut self, _mode: RepeatMode) {}
    fn set_shuffle(&mut self, _shuffle: bool) {}
    fn skip_to_next(&mut self) {}
    fn skip_to_previous(&mut self) {}

    fn repeat_mode(&self) -> RepeatMode {
        RepeatMode::Off
    }

    fn shuffle(&self) -> bool {
        false
    }

    fn playback_state(&self) -> PlaybackState {
        if self.media().is_some() && self.error().is_none() {
            PlaybackState::Ready
        } else {
            PlaybackState::Idle
        }
    }

    fn is_loading(&self) -> bool {
        self.playback_state() == PlaybackState::Buffering
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            playing: self.is_playing(),
            play_when_ready: self.play_when_ready(),
            position_ms: self.position_ms(),
            speed: self.speed(),
            volume: self.volume(),
            media: self.media(),
            error: self.error(),
        }
    }

    /// Free underlying resources. The instance is dropped afterwards.
    fn release(&mut self);
}

/// Builds a fresh player instance. Always invoked on the executor.
pub type ResourceFactory =
    Arc<dyn Fn(EventSink) -> anyhow::Result<Box<dyn PlaybackResource>> + Send + Sync>;

struct Installed {
    generation: u64,
    resource: Box<dyn PlaybackResource>,
}

/// Executor plus the slot holding the live player instance.
pub(crate) struct ResourceHost {
    executor: Arc<AffinityExecutor>,
    events: Arc<EventHub>,
    slot: Mutex<Option<Installed>>,
}

impl ResourceHost {
    pub(crate) fn new(executor: Arc<AffinityExecutor>) -> Arc<Self> {
        let events = EventHub::new(executor.clone());
        Arc::new(Self {
            executor,
            events,
            slot: Mutex::new(None),
        })
    }

    pub(crate) fn executor(&self) -> &Arc<AffinityExecutor> {
        &self.executor
    }

    pub(crate) fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub(crate) fn sink(&self) -> EventSink {
        EventSink::new(self.events.clone())
    }

    /// Generation of the installed instance, if any.
    pub(crate) fn generation(&self) -> Option<u64> {
        self.slot
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|i| i.generation))
    }

    /// Install a freshly built instance. Executor only.
    pub(crate) fn install(&self, generation: u64, resource: Box<dyn PlaybackResource>) {
        debug_assert!(self.executor.is_current());
        let mut slot = self.slot.lock().unwrap_or_else(|err| err.into_inner());
        *slot = Some(Installed {
            generation,
            resource,
        });
        drop(slot);
        self.events.drain();
    }

    /// Remove and release the installed instance. Executor only.
    pub(crate) fn release(&self) -> bool {
        debug_assert!(self.executor.is_current());
        let taken = self
            .slot
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        let Some(mut installed) = taken else {
            return false;
        };
        installed.resource.release();
        tracing::debug!(generation = installed.generation, "playback resource released");
        drop(installed);
        self.events.drain();
        true
    }

    /// Run `f` against the live instance. Must be called on the executor.
    ///
    /// `generation` pins the call to one instance; a mismatch (stale proxy)
    /// reports [`HubError::ResourceUnavailable`]. Queued events are delivered
    /// after `f` returns and the slot is unlocked.
    pub(crate) fn with_local<R>(
        &self,
        generation: Option<u64>,
        f: impl FnOnce(&mut dyn PlaybackResource) -> R,
    ) -> HubResult<R> {
        debug_assert!(self.executor.is_current());
        let result = {
            let mut slot = self.slot.lock().unwrap_or_else(|err| err.into_inner());
            match slot.as_mut() {
                Some(installed) if generation.is_none_or(|g| g == installed.generation) => {
                    Ok(f(installed.resource.as_mut()))
                }
                _ => Err(HubError::ResourceUnavailable),
            }
        };
        self.events.drain();
        result
    }
}
