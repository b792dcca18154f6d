//! In-memory player used by the CLI demo and the test suite.
//!
//! Tracks the same state a real engine would expose and records every mutation
//! together with the executor it ran on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use playback_hub_types::{Capabilities, MediaRef, PlaybackError, PlaybackState, RepeatMode};

use crate::events::{EventSink, ResourceEvent};
use crate::executor::ExecutorId;
use crate::registry::Consumer;
use crate::resource::{PlaybackResource, ResourceFactory};

/// Past this position `skip_to_previous` restarts the current item.
const RESTART_THRESHOLD_MS: u64 = 3_000;

/// Counters shared between a test/demo and every instance built by
/// [`SimulatedPlayer::factory`].
#[derive(Debug, Default)]
pub struct SimulatedPlayerStats {
    /// Instances constructed.
    pub constructed: AtomicU64,
    /// Instances released.
    pub released: AtomicU64,
    /// Mutations observed.
    pub mutations: AtomicU64,
    /// Mutations that ran off the owning executor.
    pub foreign_mutations: AtomicU64,
    /// Seeks applied.
    pub seeks: AtomicU64,
    /// Volume changes applied.
    pub volume_changes: AtomicU64,
    /// Speed changes applied.
    pub speed_changes: AtomicU64,
    /// Media changes applied.
    pub media_changes: AtomicU64,
    journal: Mutex<Vec<String>>,
}

impl SimulatedPlayerStats {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ordered list of applied mutations (`"play"`, `"seek:1000"`, ...).
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    pub fn count(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

/// Deterministic player with no real output.
pub struct SimulatedPlayer {
    owner: Option<ExecutorId>,
    sink: EventSink,
    stats: Arc<SimulatedPlayerStats>,
    play_when_ready: bool,
    position_ms: u64,
    speed: f32,
    volume: f32,
    media: Option<MediaRef>,
    error: Option<PlaybackError>,
    // Every item loaded through `set_media`, in load order.
    queue: Vec<MediaRef>,
    index: usize,
    repeat_mode: RepeatMode,
    shuffle: bool,
    ended: bool,
}

impl SimulatedPlayer {
    /// Create an instance owned by the calling executor.
    pub fn new(sink: EventSink, stats: Arc<SimulatedPlayerStats>) -> Self {
        stats.constructed.fetch_add(1, Ordering::SeqCst);
        Self {
            owner: ExecutorId::current(),
            sink,
            stats,
            play_when_ready: false,
            position_ms: 0,
            speed: 1.0,
            volume: 1.0,
            media: None,
            error: None,
            queue: Vec::new(),
            index: 0,
            repeat_mode: RepeatMode::Off,
            shuffle: false,
            ended: false,
        }
    }

    /// Factory building simulated players that share `stats`.
    pub fn factory(stats: Arc<SimulatedPlayerStats>) -> ResourceFactory {
        Arc::new(move |sink| {
            Ok(Box::new(SimulatedPlayer::new(sink, stats.clone())) as Box<dyn PlaybackResource>)
        })
    }

    fn record(&self, entry: String) {
        self.stats.mutations.fetch_add(1, Ordering::SeqCst);
        if self.owner.is_none() || ExecutorId::current() != self.owner {
            self.stats.foreign_mutations.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(mutation = %entry, "player mutated off its executor");
        }
        if let Ok(mut journal) = self.stats.journal.lock() {
            journal.push(entry);
        }
    }

    fn emit_state(&self) {
        self.sink.emit(ResourceEvent::StateChanged {
            playing: self.is_playing(),
            position_ms: self.position_ms,
            speed: self.speed,
        });
    }

    /// Make `index` the current queue item, from its start.
    fn load(&mut self, index: usize) {
        let Some(media) = self.queue.get(index).cloned() else {
            return;
        };
        self.index = index;
        self.media = Some(media.clone());
        self.position_ms = 0;
        self.error = None;
        self.ended = false;
        self.sink.emit(ResourceEvent::MediaChanged(Some(media)));
        self.emit_state();
    }

    fn clamp_position(&self, position_ms: u64) -> u64 {
        match self.media.as_ref().and_then(|m| m.duration_ms) {
            Some(total) => position_ms.min(total),
            None => position_ms,
        }
    }
}

impl PlaybackResource for SimulatedPlayer {
    fn play(&mut self) {
        self.set_play_when_ready(true);
    }

    fn pause(&mut self) {
        self.set_play_when_ready(false);
    }

    fn set_play_when_ready(&mut self, play_when_ready: bool) {
        self.record(if play_when_ready { "play" } else { "pause" }.to_string());
        if self.play_when_ready != play_when_ready {
            self.play_when_ready = play_when_ready;
            self.emit_state();
        }
    }

    fn seek_to(&mut self, position_ms: u64) {
        let target = self.clamp_position(position_ms);
        self.record(format!("seek:{target}"));
        self.stats.seeks.fetch_add(1, Ordering::SeqCst);
        self.position_ms = target;
        self.ended = false;
        self.sink.emit(ResourceEvent::SeekCompleted {
            position_ms: target,
        });
    }

    fn set_speed(&mut self, speed: f32) {
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        self.record(format!("speed:{speed}"));
        self.stats.speed_changes.fetch_add(1, Ordering::SeqCst);
        self.speed = speed;
        self.emit_state();
    }

    fn set_volume(&mut self, volume: f32) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        self.record(format!("volume:{volume}"));
        self.stats.volume_changes.fetch_add(1, Ordering::SeqCst);
        self.volume = volume;
        self.sink.emit(ResourceEvent::VolumeChanged(volume));
    }

    fn set_media(&mut self, media: Option<MediaRef>) {
        self.record(format!(
            "media:{}",
            media.as_ref().map(|m| m.id.as_str()).unwrap_or("")
        ));
        self.stats.media_changes.fetch_add(1, Ordering::SeqCst);
        match media {
            Some(media) => {
                self.queue.push(media);
                self.load(self.queue.len() - 1);
            }
            None => {
                self.queue.clear();
                self.index = 0;
                self.media = None;
                self.position_ms = 0;
                self.error = None;
                self.ended = false;
                self.sink.emit(ResourceEvent::MediaChanged(None));
                self.emit_state();
            }
        }
    }

    fn stop(&mut self) {
        self.record("stop".to_string());
        self.play_when_ready = false;
        self.position_ms = 0;
        self.ended = false;
        self.emit_state();
    }

    fn set_repeat_mode(&mut self, mode: RepeatMode) {
        self.record(format!("repeat:{mode:?}").to_ascii_lowercase());
        self.repeat_mode = mode;
    }

    fn set_shuffle(&mut self, shuffle: bool) {
        self.record(format!("shuffle:{shuffle}"));
        self.shuffle = shuffle;
    }

    fn skip_to_next(&mut self) {
        self.record("next".to_string());
        if self.queue.is_empty() {
            return;
        }
        if self.index + 1 < self.queue.len() {
            self.load(self.index + 1);
        } else if self.repeat_mode == RepeatMode::All {
            self.load(0);
        } else if !self.ended {
            self.ended = true;
            self.emit_state();
        }
    }

    fn skip_to_previous(&mut self) {
        self.record("previous".to_string());
        if self.queue.is_empty() {
            return;
        }
        if self.position_ms > RESTART_THRESHOLD_MS {
            self.load(self.index);
        } else if self.index > 0 {
            self.load(self.index - 1);
        } else if self.repeat_mode == RepeatMode::All {
            self.load(self.queue.len() - 1);
        } else {
            self.load(self.index);
        }
    }

    fn is_playing(&self) -> bool {
        self.play_when_ready && self.media.is_some() && self.error.is_none() && !self.ended
    }

    fn play_when_ready(&self) -> bool {
        self.play_when_ready
    }

    fn position_ms(&self) -> u64 {
        self.position_ms
    }

    fn speed(&self) -> f32 {
        self.speed
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn media(&self) -> Option<MediaRef> {
        self.media.clone()
    }

    fn error(&self) -> Option<PlaybackError> {
        self.error.clone()
    }

    fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    fn shuffle(&self) -> bool {
        self.shuffle
    }

    fn playback_state(&self) -> PlaybackState {
        if self.media.is_none() || self.error.is_some() {
            PlaybackState::Idle
        } else if self.ended {
            PlaybackState::Ended
        } else {
            PlaybackState::Ready
        }
    }

    fn release(&mut self) {
        self.record("release".to_string());
        self.stats.released.fetch_add(1, Ordering::SeqCst);
        self.play_when_ready = false;
        self.media = None;
        self.queue.clear();
    }
}

/// Callback observed by a [`SimulatedConsumer`].
#[derive(Clone, Debug, PartialEq)]
pub enum ConsumerNotice {
    Connected,
    Disconnected,
    State {
        playing: bool,
        position_ms: u64,
        speed: f32,
    },
    Media(Option<String>),
    Seek(u64),
    Volume(f32),
    Presentation(bool),
}

/// External consumer double recording every callback it receives.
pub struct SimulatedConsumer {
    id: String,
    capabilities: Capabilities,
    connected: AtomicBool,
    notices: Mutex<Vec<ConsumerNotice>>,
}

impl SimulatedConsumer {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::with_capabilities(id, Capabilities::default())
    }

    pub fn with_capabilities(id: impl Into<String>, capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            capabilities,
            connected: AtomicBool::new(false),
            notices: Mutex::new(Vec::new()),
        })
    }

    pub fn notices(&self) -> Vec<ConsumerNotice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Number of recorded notices equal to `notice`.
    pub fn count(&self, notice: &ConsumerNotice) -> usize {
        self.notices().iter().filter(|n| *n == notice).count()
    }

    fn note(&self, notice: ConsumerNotice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}

impl Consumer for SimulatedConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.note(ConsumerNotice::Connected);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.note(ConsumerNotice::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn on_state_changed(&self, playing: bool, position_ms: u64, speed: f32) {
        self.note(ConsumerNotice::State {
            playing,
            position_ms,
            speed,
        });
    }

    fn on_media_changed(&self, media: Option<&MediaRef>) {
        self.note(ConsumerNotice::Media(media.map(|m| m.id.clone())));
    }

    fn on_seek_completed(&self, position_ms: u64) {
        self.note(ConsumerNotice::Seek(position_ms));
    }

    fn on_volume_changed(&self, volume: f32) {
        self.note(ConsumerNotice::Volume(volume));
    }

    fn on_presentation_mode_changed(&self, presenting: bool) {
        self.note(ConsumerNotice::Presentation(presenting));
    }
}
