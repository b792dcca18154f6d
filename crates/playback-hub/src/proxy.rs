//! Resource proxy.
//!
//! Every player operation is a [`Command`] or [`Query`] value routed through one
//! affinity-checked dispatcher: in place on the executor, otherwise queued
//! (commands, fire-and-forget) or bridged to a blocking wait (queries).

use std::sync::Arc;

use playback_hub_types::{MediaRef, PlaybackError, PlaybackSnapshot, PlaybackState, RepeatMode};

use crate::call_bridge::BlockingCallBridge;
use crate::error::{HubError, HubResult};
use crate::resource::{PlaybackResource, ResourceHost};

/// Mutating player operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Play,
    Pause,
    SetPlayWhenReady(bool),
    SeekTo(u64),
    SeekForward,
    SeekBackward,
    SetSpeed(f32),
    SetVolume(f32),
    SetMedia(Option<MediaRef>),
    Stop,
    SetRepeatMode(RepeatMode),
    SetShuffle(bool),
    SkipToNext,
    SkipToPrevious,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Play => "play",
            Command::Pause => "pause",
            Command::SetPlayWhenReady(_) => "set_play_when_ready",
            Command::SeekTo(_) => "seek_to",
            Command::SeekForward => "seek_forward",
            Command::SeekBackward => "seek_backward",
            Command::SetSpeed(_) => "set_speed",
            Command::SetVolume(_) => "set_volume",
            Command::SetMedia(_) => "set_media",
            Command::Stop => "stop",
            Command::SetRepeatMode(_) => "set_repeat_mode",
            Command::SetShuffle(_) => "set_shuffle",
            Command::SkipToNext => "skip_to_next",
            Command::SkipToPrevious => "skip_to_previous",
        }
    }

    fn apply(self, resource: &mut dyn PlaybackResource, seek_increment_ms: u64) {
        match self {
            Command::Play => resource.play(),
            Command::Pause => resource.pause(),
            Command::SetPlayWhenReady(value) => resource.set_play_when_ready(value),
            Command::SeekTo(ms) => resource.seek_to(ms),
            Command::SeekForward => {
                let target = resource.position_ms().saturating_add(seek_increment_ms);
                resource.seek_to(target);
            }
            Command::SeekBackward => {
                let target = resource.position_ms().saturating_sub(seek_increment_ms);
                resource.seek_to(target);
            }
            Command::SetSpeed(speed) => resource.set_speed(speed),
            Command::SetVolume(volume) => resource.set_volume(volume),
            Command::SetMedia(media) => resource.set_media(media),
            Command::Stop => resource.stop(),
            Command::SetRepeatMode(mode) => resource.set_repeat_mode(mode),
            Command::SetShuffle(shuffle) => resource.set_shuffle(shuffle),
            Command::SkipToNext => resource.skip_to_next(),
            Command::SkipToPrevious => resource.skip_to_previous(),
        }
    }
}

/// Read-only player operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Query {
    IsPlaying,
    PlayWhenReady,
    PositionMs,
    Speed,
    Volume,
    Media,
    Error,
    Snapshot,
    RepeatMode,
    Shuffle,
    PlaybackState,
    IsLoading,
}

/// Result of a [`Query`].
#[derive(Clone, Debug, PartialEq)]
pub enum QueryValue {
    Bool(bool),
    Millis(u64),
    Float(f32),
    Media(Option<MediaRef>),
    Error(Option<PlaybackError>),
    Snapshot(PlaybackSnapshot),
    Repeat(RepeatMode),
    State(PlaybackState),
}

/// Snapshot returned when the player cannot be reached: idle, nothing loaded.
pub fn neutral_snapshot() -> PlaybackSnapshot {
    PlaybackSnapshot {
        playing: false,
        play_when_ready: false,
        position_ms: 0,
        speed: 1.0,
        volume: 1.0,
        media: None,
        error: None,
    }
}

impl Query {
    fn read(self, resource: &dyn PlaybackResource) -> QueryValue {
        match self {
            Query::IsPlaying => QueryValue::Bool(resource.is_playing()),
            Query::PlayWhenReady => QueryValue::Bool(resource.play_when_ready()),
            Query::PositionMs => QueryValue::Millis(resource.position_ms()),
            Query::Speed => QueryValue::Float(resource.speed()),
            Query::Volume => QueryValue::Float(resource.volume()),
            Query::Media => QueryValue::Media(resource.media()),
            Query::Error => QueryValue::Error(resource.error()),
            Query::Snapshot => QueryValue::Snapshot(resource.snapshot()),
            Query::RepeatMode => QueryValue::Repeat(resource.repeat_mode()),
            Query::Shuffle => QueryValue::Bool(resource.shuffle()),
            Query::PlaybackState => QueryValue::State(resource.playback_state()),
            Query::IsLoading => QueryValue::Bool(resource.is_loading()),
        }
    }

    /// Value reported when the query cannot be answered.
    pub fn neutral(self) -> QueryValue {
        let idle = neutral_snapshot();
        match self {
            Query::IsPlaying => QueryValue::Bool(idle.playing),
            Query::PlayWhenReady => QueryValue::Bool(idle.play_when_ready),
            Query::PositionMs => QueryValue::Millis(idle.position_ms),
            Query::Speed => QueryValue::Float(idle.speed),
            Query::Volume => QueryValue::Float(idle.volume),
            Query::Media => QueryValue::Media(None),
            Query::Error => QueryValue::Error(None),
            Query::Snapshot => QueryValue::Snapshot(idle),
            Query::RepeatMode => QueryValue::Repeat(RepeatMode::Off),
            Query::Shuffle | Query::IsLoading => QueryValue::Bool(false),
            Query::PlaybackState => QueryValue::State(PlaybackState::Idle),
        }
    }
}

/// Thread-safe front for the executor-confined player.
///
/// A proxy handed out by a binding handle is pinned to one instance; once that
/// instance is released every command is a logged no-op and every query
/// returns [`Query::neutral`]. Internal proxies follow whichever instance is
/// live.
#[derive(Clone)]
pub struct ResourceProxy {
    host: Arc<ResourceHost>,
    bridge: BlockingCallBridge,
    generation: Option<u64>,
    seek_increment_ms: u64,
    trace_calls: bool,
}

impl ResourceProxy {
    pub(crate) fn new(
        host: Arc<ResourceHost>,
        bridge: BlockingCallBridge,
        generation: Option<u64>,
        seek_increment_ms: u64,
        trace_calls: bool,
    ) -> Self {
        Self {
            host,
            bridge,
            generation,
            seek_increment_ms,
            trace_calls,
        }
    }

    /// Instance generation this proxy is pinned to.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// `true` while the instance this proxy targets is installed.
    pub fn is_live(&self) -> bool {
        match (self.generation, self.host.generation()) {
            (Some(pinned), Some(current)) => pinned == current,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Route a command to the player. Returns once queued; only submission
    /// failures are reported.
    pub fn dispatch(&self, command: Command) -> HubResult<()> {
        let executor = self.host.executor();
        if self.trace_calls {
            tracing::trace!(
                command = command.name(),
                on_executor = executor.is_current(),
                "dispatch"
            );
        }
        if executor.is_current() {
            return self.apply_local(command);
        }
        let proxy = self.clone();
        executor.submit(Box::new(move || {
            let _ = proxy.apply_local(command);
        }))
    }

    fn apply_local(&self, command: Command) -> HubResult<()> {
        let name = command.name();
        let increment = self.seek_increment_ms;
        self.host
            .with_local(self.generation, move |resource| command.apply(resource, increment))
            .inspect_err(|err| {
                tracing::warn!(command = name, error = %err, "command ignored");
            })
    }

    /// Run a query and wait for the answer (bounded by the call timeout).
    pub fn try_query(&self, query: Query) -> HubResult<QueryValue> {
        self.with_resource(move |resource| query.read(&*resource))
    }

    /// Run a query, falling back to [`Query::neutral`] on any failure.
    pub fn query(&self, query: Query) -> QueryValue {
        self.try_query(query).unwrap_or_else(|err| {
            tracing::debug!(?query, error = %err, "query failed; returning neutral value");
            query.neutral()
        })
    }

    /// Run an arbitrary closure against the live player on the executor and
    /// wait for its result.
    pub fn with_resource<R, F>(&self, f: F) -> HubResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn PlaybackResource) -> R + Send + 'static,
    {
        if self.host.executor().is_current() {
            return self.host.with_local(self.generation, f);
        }
        let host = self.host.clone();
        let generation = self.generation;
        self.bridge
            .invoke(move || host.with_local(generation, f))
            .and_then(|inner| inner)
    }

    fn send(&self, command: Command) {
        if let Err(err) = self.dispatch(command) {
            tracing::warn!(error = %err, "command not dispatched");
        }
    }

    pub fn play(&self) {
        self.send(Command::Play);
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn set_play_when_ready(&self, value: bool) {
        self.send(Command::SetPlayWhenReady(value));
    }

    pub fn seek_to(&self, position_ms: u64) {
        self.send(Command::SeekTo(position_ms));
    }

    pub fn seek_forward(&self) {
        self.send(Command::SeekForward);
    }

    pub fn seek_backward(&self) {
        self.send(Command::SeekBackward);
    }

    pub fn set_speed(&self, speed: f32) {
        self.send(Command::SetSpeed(speed));
    }

    pub fn set_volume(&self, volume: f32) {
        self.send(Command::SetVolume(volume));
    }

    pub fn set_media(&self, media: Option<MediaRef>) {
        self.send(Command::SetMedia(media));
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) {
        self.send(Command::SetRepeatMode(mode));
    }

    pub fn set_shuffle(&self, shuffle: bool) {
        self.send(Command::SetShuffle(shuffle));
    }

    pub fn skip_to_next(&self) {
        self.send(Command::SkipToNext);
    }

    pub fn skip_to_previous(&self) {
        self.send(Command::SkipToPrevious);
    }

    pub fn is_playing(&self) -> bool {
        match self.query(Query::IsPlaying) {
            QueryValue::Bool(value) => value,
            _ => false,
        }
    }

    pub fn play_when_ready(&self) -> bool {
        match self.query(Query::PlayWhenReady) {
            QueryValue::Bool(value) => value,
            _ => false,
        }
    }

    pub fn position_ms(&self) -> u64 {
        match self.query(Query::PositionMs) {
            QueryValue::Millis(value) => value,
            _ => 0,
        }
    }

    pub fn speed(&self) -> f32 {
        match self.query(Query::Speed) {
            QueryValue::Float(value) => value,
            _ => 1.0,
        }
    }

    pub fn volume(&self) -> f32 {
        match self.query(Query::Volume) {
            QueryValue::Float(value) => value,
            _ => 1.0,
        }
    }

    pub fn media(&self) -> Option<MediaRef> {
        match self.query(Query::Media) {
            QueryValue::Media(value) => value,
            _ => None,
        }
    }

    pub fn error(&self) -> Option<PlaybackError> {
        match self.query(Query::Error) {
            QueryValue::Error(value) => value,
            _ => None,
        }
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        match self.query(Query::RepeatMode) {
            QueryValue::Repeat(value) => value,
            _ => RepeatMode::Off,
        }
    }

    pub fn shuffle(&self) -> bool {
        match self.query(Query::Shuffle) {
            QueryValue::Bool(value) => value,
            _ => false,
        }
    }

    pub fn playback_state(&self) -> PlaybackState {
        match self.query(Query::PlaybackState) {
            QueryValue::State(value) => value,
            _ => PlaybackState::Idle,
        }
    }

    pub fn is_loading(&self) -> bool {
        match self.query(Query::IsLoading) {
            QueryValue::Bool(value) => value,
            _ => false,
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        match self.query(Query::Snapshot) {
            QueryValue::Snapshot(value) => value,
            _ => neutral_snapshot(),
        }
    }

    /// Snapshot that distinguishes "unreachable" from an idle player.
    pub fn try_snapshot(&self) -> HubResult<PlaybackSnapshot> {
        match self.try_query(Query::Snapshot)? {
            QueryValue::Snapshot(value) => Ok(value),
            _ => Err(HubError::ResourceUnavailable),
        }
    }
}
