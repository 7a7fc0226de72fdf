//! Fake host used by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pmoplayer::{
    AmbientMedia, MediaElement, MediaEvent, MediaEventSender, MediaHandle, MediaHost,
    MemoryPreferenceStore, OwnerId, PersistenceError, PlaybackCoordinator, PlaybackError,
    PlaybackPreferences, PlaybackSettings, PlaylistEntry, PreferenceStore, SurfaceCommand,
    SurfaceEndpoint, Visibility,
};

#[derive(Debug, Default)]
struct ElementState {
    playing: bool,
    position: f64,
    volume: f64,
    released: bool,
}

#[derive(Debug)]
pub struct FakeElement {
    id: String,
    source: String,
    state: Mutex<ElementState>,
    reject_play: Arc<AtomicBool>,
    events: Option<MediaEventSender>,
}

impl FakeElement {
    /// Element living in the document, not created by the engine.
    pub fn ambient(id: &str, playing: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            source: format!("https://ambient.example.org/{id}.mp3"),
            state: Mutex::new(ElementState {
                playing,
                volume: 1.0,
                ..ElementState::default()
            }),
            reject_play: Arc::new(AtomicBool::new(false)),
            events: None,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap().released
    }

    pub fn volume(&self) -> f64 {
        self.state.lock().unwrap().volume
    }

    pub fn position(&self) -> f64 {
        self.state.lock().unwrap().position
    }

    /// Reports an event as the host would.
    pub fn emit(&self, event: MediaEvent) -> bool {
        self.events.as_ref().is_some_and(|tx| tx.send(event))
    }

    pub fn handle(&self) -> Option<MediaHandle> {
        self.events.as_ref().map(|tx| tx.handle())
    }
}

#[async_trait]
impl MediaElement for FakeElement {
    fn element_id(&self) -> String {
        self.id.clone()
    }

    async fn play(&self) -> Result<(), PlaybackError> {
        if self.reject_play.load(Ordering::SeqCst) {
            return Err(PlaybackError::PlaybackRejected);
        }
        let mut state = self.state.lock().unwrap();
        if state.released {
            return Err(PlaybackError::host("element released"));
        }
        state.playing = true;
        Ok(())
    }

    fn pause(&self) {
        self.state.lock().unwrap().playing = false;
    }

    fn reset(&self) {
        self.state.lock().unwrap().position = 0.0;
    }

    fn seek(&self, seconds: f64) {
        self.state.lock().unwrap().position = seconds;
    }

    fn set_volume(&self, volume: f64) {
        self.state.lock().unwrap().volume = volume;
    }

    fn is_audible(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.playing && !state.released
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.playing = false;
        state.released = true;
    }
}

#[derive(Default)]
struct HostState {
    elements: Vec<Arc<FakeElement>>,
    surfaces: Vec<SurfaceEndpoint>,
    removed: Vec<MediaHandle>,
    ambient: Vec<AmbientMedia>,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    counter: AtomicU64,
    reject_play: Arc<AtomicBool>,
    broken: AtomicBool,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every native element refuses to play until the user interacts.
    pub fn block_autoplay(&self, blocked: bool) {
        self.reject_play.store(blocked, Ordering::SeqCst);
    }

    /// Every element creation fails, as when the document is going away.
    pub fn fail_element_creation(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn add_ambient(&self, element: Arc<FakeElement>, context: Visibility) {
        self.state.lock().unwrap().ambient.push(AmbientMedia { element, context });
    }

    pub fn elements(&self) -> Vec<Arc<FakeElement>> {
        self.state.lock().unwrap().elements.clone()
    }

    pub fn last_element(&self) -> Option<Arc<FakeElement>> {
        self.state.lock().unwrap().elements.last().cloned()
    }

    pub fn live_surfaces(&self) -> Vec<(MediaHandle, String)> {
        self.state
            .lock()
            .unwrap()
            .surfaces
            .iter()
            .map(|s| (s.handle(), s.source().to_string()))
            .collect()
    }

    pub fn removed_surfaces(&self) -> Vec<MediaHandle> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Sends `event` from the most recently embedded surface.
    pub fn surface_emit(&self, event: MediaEvent) -> bool {
        let state = self.state.lock().unwrap();
        state
            .surfaces
            .last()
            .is_some_and(|s| s.events().send(event))
    }

    /// Commands received so far by the most recently embedded surface.
    pub fn surface_commands(&self) -> Vec<SurfaceCommand> {
        let mut state = self.state.lock().unwrap();
        let Some(surface) = state.surfaces.last_mut() else {
            return Vec::new();
        };
        std::iter::from_fn(|| surface.try_next_command()).collect()
    }
}

impl MediaHost for FakeHost {
    fn create_element(
        &self,
        source: &str,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaElement>, PlaybackError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(PlaybackError::host("cannot create audio element"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let element = Arc::new(FakeElement {
            id: format!("audio-{n}"),
            source: source.to_string(),
            state: Mutex::new(ElementState {
                volume: 1.0,
                ..ElementState::default()
            }),
            reject_play: Arc::clone(&self.reject_play),
            events: Some(events),
        });
        self.state.lock().unwrap().elements.push(Arc::clone(&element));
        Ok(element)
    }

    fn embed_surface(&self, endpoint: SurfaceEndpoint) -> Result<(), PlaybackError> {
        self.state.lock().unwrap().surfaces.push(endpoint);
        Ok(())
    }

    fn remove_surface(&self, handle: MediaHandle) {
        let mut state = self.state.lock().unwrap();
        state.surfaces.retain(|s| s.handle() != handle);
        state.removed.push(handle);
    }

    fn ambient_media(&self) -> Vec<AmbientMedia> {
        let state = self.state.lock().unwrap();
        let mut media: Vec<AmbientMedia> = state
            .elements
            .iter()
            .filter(|el| !el.is_released())
            .map(|el| AmbientMedia {
                element: Arc::clone(el) as Arc<dyn MediaElement>,
                context: Visibility::Foreground,
            })
            .collect();
        media.extend(state.ambient.iter().cloned());
        media
    }
}

/// Preference backend whose reads take a while.
pub struct SlowLoadStore {
    pub inner: MemoryPreferenceStore,
    pub delay: Duration,
}

#[async_trait]
impl PreferenceStore for SlowLoadStore {
    async fn save(
        &self,
        owner: &OwnerId,
        preferences: &PlaybackPreferences,
    ) -> Result<(), PersistenceError> {
        self.inner.save(owner, preferences).await
    }

    async fn load(&self, owner: &OwnerId) -> Result<Option<PlaybackPreferences>, PersistenceError> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(owner).await
    }
}

pub fn coordinator(host: &Arc<FakeHost>, preferences: Arc<dyn PreferenceStore>) -> PlaybackCoordinator {
    coordinator_with(host, PlaybackSettings::default(), preferences)
}

pub fn coordinator_with(
    host: &Arc<FakeHost>,
    settings: PlaybackSettings,
    preferences: Arc<dyn PreferenceStore>,
) -> PlaybackCoordinator {
    PlaybackCoordinator::new(settings, Arc::clone(host) as Arc<dyn MediaHost>, preferences)
}

pub fn tracks(n: usize) -> Vec<PlaylistEntry> {
    (0..n)
        .map(|i| {
            PlaylistEntry::new(
                format!("https://cdn.example.org/music/track-{i}.mp3"),
                format!("Track {i}"),
            )
        })
        .collect()
}

pub fn clip(id: &str) -> PlaylistEntry {
    PlaylistEntry::new(format!("https://www.youtube.com/watch?v={id}"), format!("Clip {id}"))
}

/// Lets timers and background tasks run for `ms` of virtual time.
pub async fn pass(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
