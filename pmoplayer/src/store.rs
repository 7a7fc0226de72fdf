//! Single source of truth for the playback state.
//!
//! Every setter mutates under the state mutex, collects the resulting
//! events, releases the mutex and only then publishes on the bus, so
//! listeners can freely call back into the store.
//!
//! Changing the source (URL or backend kind) is only allowed while the
//! transition lock is idle, or by the transition that holds it. The claim
//! on the lock is held for the whole mutation, so a transition cannot start
//! between the check and the write.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::backend::SourceClassifier;
use crate::config_ext::PlaybackSettings;
use crate::errors::PlaybackError;
use crate::events::{PlaybackEvent, PlaybackEventBus, PlaybackNotice};
use crate::model::{
    BackendKind, OwnerId, PlaybackPreferences, PlaybackSession, Playlist, PlaylistEntry,
    clamp_volume,
};
use crate::transition::{
    SharedTransitionLock, TransitionLock, TransitionRequest, TransitionTicket, target_index,
};

/// Partial transport update; `None` fields are left untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TransportUpdate {
    pub playing: Option<bool>,
    pub current_time: Option<f64>,
    pub duration: Option<f64>,
}

#[derive(Debug)]
struct StoreState {
    session: PlaybackSession,
    playlist: Playlist,
    active_index: usize,
    /// Bumped on every durable mutation (playlist, index, volume).
    version: u64,
    /// Durable preferences already applied for this session.
    seeded: bool,
}

impl StoreState {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Points the session at the active entry (or nothing) and resets transport.
    fn select_active(&mut self, classifier: &SourceClassifier, events: &mut Vec<PlaybackEvent>) {
        let was_playing = self.session.is_playing;
        match self.playlist.get(self.active_index) {
            Some(entry) => {
                self.session.source_url = Some(entry.url().to_string());
                self.session.track_title = Some(entry.title().to_string());
                self.session.backend_kind = classifier.classify(entry.url());
            }
            None => {
                self.active_index = 0;
                self.session.source_url = None;
                self.session.track_title = None;
                self.session.backend_kind = BackendKind::Native;
            }
        }
        self.session.is_playing = false;
        self.session.current_time = 0.0;
        self.session.duration = None;

        if was_playing {
            events.push(PlaybackEvent::PlayingChanged { playing: false });
        }
        events.push(self.track_event());
    }

    fn track_event(&self) -> PlaybackEvent {
        PlaybackEvent::TrackChanged {
            index: self.active_index,
            source_url: self.session.source_url.clone(),
            title: self.session.track_title.clone(),
            backend: self.session.backend_kind,
        }
    }

    fn playlist_event(&self) -> PlaybackEvent {
        PlaybackEvent::PlaylistChanged {
            len: self.playlist.len(),
            active_index: self.active_index,
            version: self.version,
        }
    }
}

#[derive(Clone)]
pub struct PlaybackStore {
    state: Arc<Mutex<StoreState>>,
    lock: SharedTransitionLock,
    classifier: SourceClassifier,
    bus: PlaybackEventBus,
    default_volume: f64,
}

impl fmt::Debug for PlaybackStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackStore")
            .field("state", &*self.state())
            .finish()
    }
}

impl PlaybackStore {
    pub fn new(
        settings: &PlaybackSettings,
        lock: SharedTransitionLock,
        bus: PlaybackEventBus,
    ) -> Self {
        let state = StoreState {
            session: PlaybackSession::new(None, settings.default_volume),
            playlist: Playlist::new(settings.max_playlist_entries),
            active_index: 0,
            version: 0,
            seeded: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            lock,
            classifier: SourceClassifier::new(settings.external_hosts.iter().cloned()),
            bus,
            default_volume: settings.default_volume,
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition_lock(&self) -> MutexGuard<'_, TransitionLock> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails unless the lock is idle or held by `ticket`. The returned guard
    /// must be kept until the mutation is done. The lock is always taken
    /// before the state mutex, never the other way round.
    fn claim(
        &self,
        ticket: Option<TransitionTicket>,
    ) -> Result<MutexGuard<'_, TransitionLock>, PlaybackError> {
        let lock = self.transition_lock();
        if lock.permits(ticket) {
            Ok(lock)
        } else {
            Err(PlaybackError::TransitionInProgress)
        }
    }

    pub fn bus(&self) -> &PlaybackEventBus {
        &self.bus
    }

    pub fn classifier(&self) -> &SourceClassifier {
        &self.classifier
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> PlaybackSession {
        self.state().session.clone()
    }

    pub fn playlist(&self) -> Vec<PlaylistEntry> {
        self.state().playlist.entries().to_vec()
    }

    pub fn playlist_len(&self) -> usize {
        self.state().playlist.len()
    }

    pub fn active_index(&self) -> usize {
        self.state().active_index
    }

    pub fn active_entry(&self) -> Option<PlaylistEntry> {
        let state = self.state();
        state.playlist.get(state.active_index).cloned()
    }

    pub fn volume(&self) -> f64 {
        self.state().session.volume
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.state().session.owner_id.clone()
    }

    pub fn save_version(&self) -> u64 {
        self.state().version
    }

    pub fn is_seeded(&self) -> bool {
        self.state().seeded
    }

    /// The durable triple together with the version it corresponds to.
    pub fn preferences(&self) -> (PlaybackPreferences, u64) {
        let state = self.state();
        (
            PlaybackPreferences {
                playlist: state.playlist.entries().to_vec(),
                active_index: state.active_index,
                volume: state.session.volume,
            },
            state.version,
        )
    }

    // ------------------------------------------------------------------
    // Source / playlist setters
    // ------------------------------------------------------------------

    /// Replaces the current source without touching the playlist.
    pub fn set_source(
        &self,
        source_url: Option<String>,
        title: Option<String>,
        ticket: Option<TransitionTicket>,
    ) -> Result<(), PlaybackError> {
        let mut events = Vec::new();
        {
            let _claim = self.claim(ticket)?;
            let mut state = self.state();
            let was_playing = state.session.is_playing;
            state.session.backend_kind = source_url
                .as_deref()
                .map(|url| self.classifier.classify(url))
                .unwrap_or_default();
            state.session.source_url = source_url;
            state.session.track_title = title;
            state.session.is_playing = false;
            state.session.current_time = 0.0;
            state.session.duration = None;
            if was_playing {
                events.push(PlaybackEvent::PlayingChanged { playing: false });
            }
            events.push(state.track_event());
        }
        self.bus.publish_all(events);
        Ok(())
    }

    /// Replaces the playlist. The active index becomes `target` (range
    /// checked) or 0, and the source follows the active entry.
    pub fn set_playlist(
        &self,
        entries: Vec<PlaylistEntry>,
        owner: Option<OwnerId>,
        target: Option<usize>,
    ) -> Result<(), PlaybackError> {
        let mut events = Vec::new();
        {
            let _claim = self.claim(None)?;
            let mut state = self.state();
            let (playlist, dropped) = Playlist::from_entries(entries, state.playlist.max_entries());
            if dropped > 0 {
                warn!(
                    dropped,
                    max = playlist.max_entries(),
                    "Playlist exceeds capacity; extra entries dropped"
                );
            }
            let active_index = match target {
                Some(index) if index < playlist.len() => index,
                Some(index) => {
                    return Err(PlaybackError::InvalidIndex {
                        index,
                        len: playlist.len(),
                    });
                }
                None => 0,
            };

            state.playlist = playlist;
            state.active_index = active_index;
            if let Some(owner) = owner {
                state.session.owner_id = Some(owner);
            }
            state.session.autoplay_pending = false;
            state.bump();
            state.select_active(&self.classifier, &mut events);
            events.insert(0, state.playlist_event());
            debug!(len = state.playlist.len(), active_index, "Playlist replaced");
        }
        self.bus.publish_all(events);
        Ok(())
    }

    /// Appends an entry; the first entry of an empty playlist becomes the
    /// source. Returns the entry index.
    pub fn append_entry(&self, entry: PlaylistEntry) -> Result<usize, PlaybackError> {
        let mut events = Vec::new();
        let index = {
            let lock = self.transition_lock();
            let mut state = self.state();
            if state.playlist.is_empty() && !lock.permits(None) {
                return Err(PlaybackError::TransitionInProgress);
            }
            let index = state.playlist.push(entry)?;
            state.bump();
            events.push(state.playlist_event());
            if state.playlist.len() == 1 {
                state.active_index = 0;
                state.select_active(&self.classifier, &mut events);
            }
            index
        };
        self.bus.publish_all(events);
        Ok(index)
    }

    /// Removes the entry at `index`. The active index keeps pointing at the
    /// same entry; when the active entry itself goes, the entry that slides
    /// into its place (clamped) becomes the source. Returns the removed entry
    /// and whether the source changed.
    pub fn remove_entry(&self, index: usize) -> Result<(PlaylistEntry, bool), PlaybackError> {
        let mut events = Vec::new();
        let removed = {
            let lock = self.transition_lock();
            let mut state = self.state();
            let source_changed = index == state.active_index;
            if source_changed && !lock.permits(None) {
                return Err(PlaybackError::TransitionInProgress);
            }
            let removed = state.playlist.remove(index)?;
            if index < state.active_index {
                state.active_index -= 1;
            } else if source_changed {
                state.active_index = state.active_index.min(state.playlist.len().saturating_sub(1));
            }
            state.bump();
            events.push(state.playlist_event());
            if source_changed {
                state.session.autoplay_pending = false;
                state.select_active(&self.classifier, &mut events);
            }
            (removed, source_changed)
        };
        self.bus.publish_all(events);
        Ok(removed)
    }

    pub fn clear_playlist(&self) -> Result<(), PlaybackError> {
        self.set_playlist(Vec::new(), None, None)
    }

    /// Moves to `index` and makes its entry the source.
    pub fn set_active_index(
        &self,
        index: usize,
        ticket: Option<TransitionTicket>,
    ) -> Result<PlaylistEntry, PlaybackError> {
        let mut events = Vec::new();
        let entry = {
            let _claim = self.claim(ticket)?;
            let mut state = self.state();
            let Some(entry) = state.playlist.get(index).cloned() else {
                return Err(PlaybackError::InvalidIndex {
                    index,
                    len: state.playlist.len(),
                });
            };
            state.active_index = index;
            state.bump();
            state.select_active(&self.classifier, &mut events);
            entry
        };
        self.bus.publish_all(events);
        Ok(entry)
    }

    /// Resolves `request` against the current playlist in one read. Returns
    /// the active index, the target index and the target entry, or `None`
    /// when the playlist is empty.
    pub fn transition_target(
        &self,
        request: TransitionRequest,
    ) -> Result<Option<(usize, usize, PlaylistEntry)>, PlaybackError> {
        let state = self.state();
        let Some(target) = target_index(request, state.active_index, state.playlist.len())? else {
            return Ok(None);
        };
        Ok(state
            .playlist
            .get(target)
            .cloned()
            .map(|entry| (state.active_index, target, entry)))
    }

    /// Makes `target` the source, wherever it sits now. Entries that are not
    /// the active one may be removed while a transition settles, so the
    /// index resolved at the start is only a hint: the entry is looked up
    /// there first, then at the nearest equal position. If it is gone the
    /// entry that slid into the hinted slot (clamped) is selected.
    /// Returns the final index and entry.
    pub fn commit_transition(
        &self,
        target: &PlaylistEntry,
        hint: usize,
        ticket: TransitionTicket,
    ) -> Result<(usize, PlaylistEntry), PlaybackError> {
        let mut events = Vec::new();
        let (index, entry) = {
            let _claim = self.claim(Some(ticket))?;
            let mut state = self.state();
            let len = state.playlist.len();
            if len == 0 {
                return Err(PlaybackError::InvalidIndex { index: hint, len });
            }
            let index = if state.playlist.get(hint) == Some(target) {
                hint
            } else {
                state
                    .playlist
                    .entries()
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| *entry == target)
                    .min_by_key(|(i, _)| i.abs_diff(hint))
                    .map(|(i, _)| i)
                    .unwrap_or_else(|| {
                        warn!(hint, title = target.title(), "Transition target removed; using its slot");
                        hint.min(len - 1)
                    })
            };
            if index != hint {
                debug!(hint, index, "Transition target moved while settling");
            }
            state.active_index = index;
            state.bump();
            state.select_active(&self.classifier, &mut events);
            (index, state.playlist.entries()[index].clone())
        };
        self.bus.publish_all(events);
        Ok((index, entry))
    }

    // ------------------------------------------------------------------
    // Transport / volume
    // ------------------------------------------------------------------

    /// Always clamps. Returns the stored value.
    pub fn set_volume(&self, volume: f64) -> f64 {
        let volume = clamp_volume(volume);
        let changed = {
            let mut state = self.state();
            let changed = state.session.volume != volume;
            if changed {
                state.session.volume = volume;
                state.bump();
            }
            changed
        };
        if changed {
            self.bus.publish(PlaybackEvent::VolumeChanged { volume });
        }
        volume
    }

    pub fn set_transport(&self, update: TransportUpdate) {
        let mut events = Vec::new();
        {
            let mut state = self.state();
            if let Some(playing) = update.playing {
                if state.session.is_playing != playing {
                    state.session.is_playing = playing;
                    events.push(PlaybackEvent::PlayingChanged { playing });
                }
            }
            let mut progressed = false;
            if let Some(time) = update.current_time {
                state.session.current_time = if time.is_finite() { time.max(0.0) } else { 0.0 };
                progressed = true;
            }
            if let Some(duration) = update.duration {
                state.session.duration = (duration.is_finite() && duration > 0.0).then_some(duration);
                progressed = true;
            }
            if progressed {
                events.push(PlaybackEvent::TransportProgress {
                    current_time: state.session.current_time,
                    duration: state.session.duration,
                });
            }
        }
        self.bus.publish_all(events);
    }

    pub fn set_playing(&self, playing: bool) {
        self.set_transport(TransportUpdate {
            playing: Some(playing),
            ..TransportUpdate::default()
        });
    }

    pub fn set_autoplay_pending(&self, pending: bool) {
        self.state().session.autoplay_pending = pending;
    }

    /// Returns the flag and clears it.
    pub fn take_autoplay_pending(&self) -> bool {
        std::mem::take(&mut self.state().session.autoplay_pending)
    }

    /// Emits a notice when the flag goes up.
    pub fn set_needs_user_gesture(&self, needed: bool) {
        let raised = {
            let mut state = self.state();
            let raised = needed && !state.session.needs_user_gesture;
            state.session.needs_user_gesture = needed;
            raised
        };
        if raised {
            self.bus
                .publish(PlaybackEvent::Notice(PlaybackNotice::NeedsUserGesture));
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Starts a fresh session for `owner`: empty playlist, default volume.
    /// The save version keeps growing across sessions.
    pub fn replace_session(&self, owner: Option<OwnerId>) -> Result<(), PlaybackError> {
        let mut events = Vec::new();
        {
            let _claim = self.claim(None)?;
            let mut state = self.state();
            let was_playing = state.session.is_playing;
            let max_entries = state.playlist.max_entries();
            state.session = PlaybackSession::new(owner, self.default_volume);
            state.playlist = Playlist::new(max_entries);
            state.active_index = 0;
            state.seeded = false;
            if was_playing {
                events.push(PlaybackEvent::PlayingChanged { playing: false });
            }
            events.push(state.playlist_event());
            events.push(state.track_event());
            events.push(PlaybackEvent::VolumeChanged {
                volume: state.session.volume,
            });
        }
        self.bus.publish_all(events);
        Ok(())
    }

    /// Applies durable preferences once per session, and only if nothing
    /// was mutated since `expected_version` was read. Returns whether the
    /// preferences were applied.
    pub fn seed(&self, preferences: PlaybackPreferences, expected_version: u64) -> bool {
        let mut events = Vec::new();
        {
            let Ok(_claim) = self.claim(None) else {
                return false;
            };
            let mut state = self.state();
            if state.seeded || state.version != expected_version {
                debug!(
                    seeded = state.seeded,
                    version = state.version,
                    expected_version,
                    "Skipping seed: store already mutated"
                );
                return false;
            }

            let (playlist, dropped) =
                Playlist::from_entries(preferences.playlist, state.playlist.max_entries());
            if dropped > 0 {
                warn!(dropped, "Stored playlist exceeds capacity; extra entries dropped");
            }
            state.active_index = if preferences.active_index < playlist.len() {
                preferences.active_index
            } else {
                0
            };
            state.playlist = playlist;
            state.session.volume = clamp_volume(preferences.volume);
            state.seeded = true;

            events.push(state.playlist_event());
            state.select_active(&self.classifier, &mut events);
            events.push(PlaybackEvent::VolumeChanged {
                volume: state.session.volume,
            });
        }
        self.bus.publish_all(events);
        true
    }

    /// Marks the session as seeded without applying anything (nothing stored).
    pub fn mark_seeded(&self) {
        self.state().seeded = true;
    }
}
