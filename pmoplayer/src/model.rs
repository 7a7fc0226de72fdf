//! Value types shared by every component of the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::PlaybackError;

/// Identifier of the user whose playlist and preferences are played and
/// persisted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        OwnerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which of the two playback engines renders a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Media element owned by the coordinator.
    #[default]
    Native,
    /// Third-party player embedded in a frame, driven by messages.
    External,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => f.write_str("native"),
            BackendKind::External => f.write_str("external"),
        }
    }
}

/// Whether the hosting tab is currently visible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Visibility {
    #[default]
    Foreground,
    Background,
}

impl Visibility {
    pub fn is_background(self) -> bool {
        matches!(self, Visibility::Background)
    }
}

/// One playable item. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaylistEntry {
    url: String,
    title: String,
}

impl PlaylistEntry {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

/// Ordered, capacity-bounded list of entries. Order is playback order.
#[derive(Clone, Debug, PartialEq)]
pub struct Playlist {
    entries: Vec<PlaylistEntry>,
    max_entries: usize,
}

impl Playlist {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
        }
    }

    /// Builds a playlist from `entries`, dropping whatever exceeds the
    /// capacity. Returns the playlist and the number of dropped entries.
    pub fn from_entries(mut entries: Vec<PlaylistEntry>, max_entries: usize) -> (Self, usize) {
        let dropped = entries.len().saturating_sub(max_entries);
        entries.truncate(max_entries);
        (
            Self {
                entries,
                max_entries,
            },
            dropped,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&PlaylistEntry> {
        self.entries.get(index)
    }

    pub fn push(&mut self, entry: PlaylistEntry) -> Result<usize, PlaybackError> {
        if self.entries.len() >= self.max_entries {
            return Err(PlaybackError::PlaylistFull(self.max_entries));
        }
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    pub fn remove(&mut self, index: usize) -> Result<PlaylistEntry, PlaybackError> {
        if index >= self.entries.len() {
            return Err(PlaybackError::InvalidIndex {
                index,
                len: self.entries.len(),
            });
        }
        Ok(self.entries.remove(index))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Live state of the player for the current session.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSession {
    pub source_url: Option<String>,
    pub backend_kind: BackendKind,
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub volume: f64,
    pub track_title: Option<String>,
    pub owner_id: Option<OwnerId>,
    /// The next backend to become ready must start playing on its own.
    pub autoplay_pending: bool,
    /// The platform refused to start audio; the UI should ask for a click.
    pub needs_user_gesture: bool,
}

impl PlaybackSession {
    pub fn new(owner_id: Option<OwnerId>, volume: f64) -> Self {
        Self {
            source_url: None,
            backend_kind: BackendKind::Native,
            is_playing: false,
            current_time: 0.0,
            duration: None,
            volume: clamp_volume(volume),
            track_title: None,
            owner_id,
            autoplay_pending: false,
            needs_user_gesture: false,
        }
    }
}

/// The durable triple mirrored to the persistence backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackPreferences {
    pub playlist: Vec<PlaylistEntry>,
    pub active_index: usize,
    pub volume: f64,
}

/// Clamps a volume into `[0, 1]`; NaN is treated as silence.
pub fn clamp_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}
