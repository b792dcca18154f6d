use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity and display metadata of the media item loaded into the player.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    /// Stable media id (URI, library id, ...).
    pub id: String,
    /// Track title.
    pub title: Option<String>,
    /// Track artist.
    pub artist: Option<String>,
    /// Album name.
    pub album: Option<String>,
    /// Artwork location used by presentation surfaces.
    pub artwork_url: Option<String>,
    /// Total duration in milliseconds when known.
    pub duration_ms: Option<u64>,
}

impl MediaRef {
    /// Create a media reference carrying only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Builder-style title setter.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Builder-style artist setter.
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    /// Builder-style duration setter.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Error reported by the player resource.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackError {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Queue repeat behaviour.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    /// Repeat the current item.
    One,
    /// Wrap around the whole queue.
    All,
}

/// Coarse engine state, independent of the play/pause intent.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Nothing loaded, or stopped after an error.
    #[default]
    Idle,
    Buffering,
    Ready,
    /// Reached the end of the queue.
    Ended,
}

/// Point-in-time view of the player resource.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlaybackSnapshot {
    /// `true` when the player is actively rendering media.
    pub playing: bool,
    /// Play/pause intent (`false` means paused by the user).
    pub play_when_ready: bool,
    /// Current position in milliseconds.
    pub position_ms: u64,
    /// Playback rate (1.0 is normal speed).
    pub speed: f32,
    /// Volume level in `0.0..=1.0`.
    pub volume: f32,
    /// Loaded media item, if any.
    pub media: Option<MediaRef>,
    /// Last player error, if any.
    pub error: Option<PlaybackError>,
}

/// Named, independently updatable channels of playback state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncField {
    /// Pause flag (`SyncValue::Bool`).
    Paused,
    /// Seek target in milliseconds (`SyncValue::Millis`).
    SeekPosition,
    /// Playback rate (`SyncValue::Float`).
    PlaybackSpeed,
    /// Volume level in `0.0..=1.0` (`SyncValue::Float`).
    VolumeLevel,
    /// Loaded media item (`SyncValue::Media`).
    MediaIdentity,
}

impl SyncField {
    /// Every field, in canonical order.
    pub const ALL: [SyncField; 5] = [
        SyncField::Paused,
        SyncField::SeekPosition,
        SyncField::PlaybackSpeed,
        SyncField::VolumeLevel,
        SyncField::MediaIdentity,
    ];

    /// Value kind this field accepts.
    pub fn kind(self) -> SyncValueKind {
        match self {
            SyncField::Paused => SyncValueKind::Bool,
            SyncField::SeekPosition => SyncValueKind::Millis,
            SyncField::PlaybackSpeed | SyncField::VolumeLevel => SyncValueKind::Float,
            SyncField::MediaIdentity => SyncValueKind::Media,
        }
    }

    /// Read this field out of a snapshot.
    pub fn read(self, snapshot: &PlaybackSnapshot) -> SyncValue {
        match self {
            SyncField::Paused => SyncValue::Bool(!snapshot.play_when_ready),
            SyncField::SeekPosition => SyncValue::Millis(snapshot.position_ms),
            SyncField::PlaybackSpeed => SyncValue::Float(snapshot.speed),
            SyncField::VolumeLevel => SyncValue::Float(snapshot.volume),
            SyncField::MediaIdentity => SyncValue::Media(snapshot.media.clone()),
        }
    }
}

/// Discriminant of [`SyncValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncValueKind {
    Bool,
    Millis,
    Float,
    Media,
}

/// Typed value carried by a sync update.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SyncValue {
    Bool(bool),
    Millis(u64),
    Float(f32),
    Media(Option<MediaRef>),
}

impl SyncValue {
    /// Kind of this value.
    pub fn kind(&self) -> SyncValueKind {
        match self {
            SyncValue::Bool(_) => SyncValueKind::Bool,
            SyncValue::Millis(_) => SyncValueKind::Millis,
            SyncValue::Float(_) => SyncValueKind::Float,
            SyncValue::Media(_) => SyncValueKind::Media,
        }
    }
}

/// Mapping from a subset of fields to new values.
pub type SyncUpdate = BTreeMap<SyncField, SyncValue>;

/// Build a full [`SyncUpdate`] out of a snapshot.
pub fn sync_state_from_snapshot(snapshot: &PlaybackSnapshot) -> SyncUpdate {
    SyncField::ALL
        .iter()
        .map(|field| (*field, field.read(snapshot)))
        .collect()
}

/// Capability flags declared by an external consumer (`name -> enabled`).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Capabilities(pub BTreeMap<String, bool>);

impl Capabilities {
    /// Builder-style flag setter.
    pub fn with(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.0.insert(name.into(), enabled);
        self
    }

    /// `true` when the flag is present and enabled.
    pub fn supports(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }
}

/// Transport control offered by a presentation surface.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Play,
    Pause,
    Stop,
    SeekForward { increment_ms: u64 },
    SeekBackward { increment_ms: u64 },
}

/// Everything a presentation surface needs to render controls.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PresentationDescriptor {
    pub title: String,
    pub subtitle: Option<String>,
    pub artwork_url: Option<String>,
    pub playing: bool,
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    pub actions: Vec<ControlAction>,
}

/// Registry counters exposed for diagnostics.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: usize,
    pub connected: usize,
    pub listeners: usize,
    pub ids: Vec<String>,
}
