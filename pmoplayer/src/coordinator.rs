//! Public facade of the playback engine.
//!
//! [`PlaybackCoordinator`] owns one instance of each component, wires them
//! together and exposes the operation set used by UI collaborators. Events
//! reported by backends are pumped into the store by a background task.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crossbeam_channel::Receiver;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendAdapter, MediaEvent, MediaHandle, MediaHost, PlayOutcome};
use crate::config_ext::{PlaybackConfigExt, PlaybackSettings};
use crate::errors::PlaybackError;
use crate::events::{
    PlaybackEvent, PlaybackEventBus, PlaybackNotice, SubscriptionId, Topic,
};
use crate::model::{OwnerId, PlaybackSession, PlaylistEntry, Visibility};
use crate::persistence::{PersistenceBridge, PreferenceStore};
use crate::registry::{MediaRegistry, StopOptions};
use crate::store::{PlaybackStore, TransportUpdate};
use crate::transition::{
    LockState, TransitionGuard, TransitionLock, TransitionOutcome, TransitionRequest,
    TransitionTimings,
};

struct CoordinatorInner {
    settings: PlaybackSettings,
    bus: PlaybackEventBus,
    store: PlaybackStore,
    registry: MediaRegistry,
    adapter: BackendAdapter,
    guard: TransitionGuard,
    persistence: PersistenceBridge,
    visibility: Mutex<Visibility>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct PlaybackCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for PlaybackCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackCoordinator")
            .field("store", &self.inner.store)
            .field("registry", &self.inner.registry)
            .field("adapter", &self.inner.adapter)
            .field("visibility", &self.visibility())
            .finish()
    }
}

impl PlaybackCoordinator {
    /// Builds the engine. Must be called from within a tokio runtime: the
    /// backend event pump is spawned here.
    pub fn new(
        settings: PlaybackSettings,
        host: Arc<dyn MediaHost>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        let bus = PlaybackEventBus::new();
        let lock = TransitionLock::shared();
        let store = PlaybackStore::new(&settings, Arc::clone(&lock), bus.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = MediaRegistry::new(host, events_tx);
        let adapter = BackendAdapter::new(store.clone(), settings.ready_retry);
        let guard = TransitionGuard::new(
            lock,
            store.clone(),
            registry.clone(),
            adapter.clone(),
            TransitionTimings {
                settle_delay: settings.settle_delay,
                grace: settings.grace,
                timeout: settings.transition_timeout,
            },
        );
        let persistence = PersistenceBridge::new(preferences, settings.save_debounce, bus.clone());

        let inner = Arc::new(CoordinatorInner {
            settings,
            bus,
            store,
            registry,
            adapter,
            guard,
            persistence,
            visibility: Mutex::new(Visibility::Foreground),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(pump_media_events(Arc::downgrade(&inner), events_rx));
        *inner.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        info!("Playback coordinator started");
        Self { inner }
    }

    /// Builds the engine with the settings of the `playback` config section.
    pub fn from_config(
        config: &pmoconfig::Config,
        host: Arc<dyn MediaHost>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self::new(config.playback_settings(), host, preferences)
    }

    pub fn settings(&self) -> &PlaybackSettings {
        &self.inner.settings
    }

    // ------------------------------------------------------------------
    // Session & playlist
    // ------------------------------------------------------------------

    /// Replaces the session for `owner`, then seeds it from the stored
    /// preferences unless something was mutated while they were loading.
    pub async fn start_session(&self, owner: Option<OwnerId>) -> Result<(), PlaybackError> {
        let inner = &self.inner;
        inner.store.replace_session(owner.clone())?;
        self.teardown_resources(StopOptions::default());

        let Some(owner) = owner else {
            inner.store.mark_seeded();
            return Ok(());
        };

        let version = inner.store.save_version();
        match inner.persistence.load(&owner).await {
            Some(preferences) => {
                if inner.store.seed(preferences, version) {
                    info!(%owner, tracks = inner.store.playlist_len(), "Session restored");
                }
            }
            None => inner.store.mark_seeded(),
        }
        Ok(())
    }

    /// Replaces the playlist and makes its first entry the source.
    pub fn set_playlist(
        &self,
        entries: Vec<PlaylistEntry>,
        owner: Option<OwnerId>,
    ) -> Result<(), PlaybackError> {
        self.set_playlist_at(entries, owner, None)
    }

    /// Same as [`set_playlist`](Self::set_playlist) with an explicit active index.
    pub fn set_playlist_at(
        &self,
        entries: Vec<PlaylistEntry>,
        owner: Option<OwnerId>,
        active_index: Option<usize>,
    ) -> Result<(), PlaybackError> {
        self.inner.store.set_playlist(entries, owner, active_index)?;
        self.teardown_resources(StopOptions::default());
        self.schedule_save();
        Ok(())
    }

    pub fn append(&self, entry: PlaylistEntry) -> Result<usize, PlaybackError> {
        let index = self.inner.store.append_entry(entry)?;
        self.schedule_save();
        Ok(index)
    }

    pub fn remove(&self, index: usize) -> Result<PlaylistEntry, PlaybackError> {
        let (entry, source_changed) = self.inner.store.remove_entry(index)?;
        if source_changed {
            self.teardown_resources(StopOptions::default());
        }
        self.schedule_save();
        Ok(entry)
    }

    pub fn clear_playlist(&self) -> Result<(), PlaybackError> {
        self.set_playlist(Vec::new(), None)
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Starts the current source, creating its backend resource on demand.
    ///
    /// While a transition is tearing down the previous source no resource is
    /// created here: the request is kept as pending autoplay and honoured
    /// once the transition has loaded the new source.
    pub async fn play(&self) -> Result<PlayOutcome, PlaybackError> {
        let inner = &self.inner;
        if !inner.adapter.has_backend() {
            if self.lock_state() == LockState::Transitioning {
                inner.store.set_autoplay_pending(true);
                debug!("Transition in progress; play deferred to autoplay");
                return Ok(PlayOutcome::Unavailable);
            }
            if self.load_active()?.is_none() {
                return Ok(PlayOutcome::Unavailable);
            }
        }
        let outcome = inner.adapter.play().await;
        if outcome.started() {
            inner.store.set_autoplay_pending(false);
        }
        Ok(outcome)
    }

    pub fn pause(&self) {
        self.inner.store.set_autoplay_pending(false);
        self.inner.adapter.pause();
    }

    pub async fn next(&self) -> Result<TransitionOutcome, PlaybackError> {
        self.transition(TransitionRequest::Next).await
    }

    pub async fn previous(&self) -> Result<TransitionOutcome, PlaybackError> {
        self.transition(TransitionRequest::Previous).await
    }

    pub async fn jump_to(&self, index: usize) -> Result<TransitionOutcome, PlaybackError> {
        self.transition(TransitionRequest::JumpTo(index)).await
    }

    async fn transition(
        &self,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome, PlaybackError> {
        let outcome = self.inner.guard.run(request, self.visibility()).await?;
        if outcome.switched().is_some() {
            self.schedule_save();
            match self.load_active() {
                Ok(_) => self.kick_autoplay().await,
                Err(err) => self.report_backend_error(err.to_string()),
            }
        }
        Ok(outcome)
    }

    pub fn seek_to(&self, seconds: f64) -> bool {
        self.inner.adapter.seek_to(seconds)
    }

    /// Returns the clamped volume actually applied.
    pub fn set_volume(&self, volume: f64) -> f64 {
        let volume = self.inner.adapter.set_volume(volume);
        self.schedule_save();
        volume
    }

    // ------------------------------------------------------------------
    // Host notifications
    // ------------------------------------------------------------------

    pub fn set_visibility(&self, visibility: Visibility) {
        let previous = std::mem::replace(&mut *self.visibility_slot(), visibility);
        if previous != visibility {
            debug!(?visibility, "Visibility changed");
        }
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility_slot()
    }

    fn visibility_slot(&self) -> MutexGuard<'_, Visibility> {
        self.inner
            .visibility
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies an event reported by the resource `handle`. Events of
    /// resources that are no longer installed are ignored.
    pub async fn handle_media_event(&self, handle: MediaHandle, event: MediaEvent) {
        let inner = &self.inner;
        if !inner.adapter.is_current(handle) {
            debug!(media = %handle, ?event, "Ignoring event from retired resource");
            return;
        }

        match event {
            MediaEvent::Ready => {
                inner.adapter.mark_external_ready(handle);
                self.kick_autoplay().await;
            }
            MediaEvent::Progress {
                current_time,
                duration,
            } => inner.store.set_transport(TransportUpdate {
                current_time: Some(current_time),
                duration,
                ..TransportUpdate::default()
            }),
            MediaEvent::Ended => {
                inner.store.set_playing(false);
                match self.next().await {
                    Ok(outcome) => debug!(?outcome, "Auto-advance after end of track"),
                    Err(err) => warn!(error = %err, "Auto-advance failed"),
                }
            }
            MediaEvent::Error(message) => {
                warn!(media = %handle, %message, "Backend reported an error");
                self.report_backend_error(message);
            }
        }
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&PlaybackEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(topic, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Receiver of every event published from now on.
    pub fn events(&self) -> Receiver<PlaybackEvent> {
        self.inner.bus.channel()
    }

    pub fn snapshot(&self) -> PlaybackSession {
        self.inner.store.snapshot()
    }

    pub fn playlist(&self) -> Vec<PlaylistEntry> {
        self.inner.store.playlist()
    }

    pub fn active_index(&self) -> usize {
        self.inner.store.active_index()
    }

    pub fn lock_state(&self) -> LockState {
        self.inner.guard.lock_state()
    }

    /// Resources currently producing sound.
    pub fn audible_resources(&self) -> usize {
        self.inner.registry.audible_count()
    }

    pub fn tracked_resources(&self) -> usize {
        self.inner.registry.owned_count() + self.inner.registry.surface_count()
    }

    /// Waits for pending preference writes.
    pub async fn flush(&self) {
        self.inner.persistence.flush().await;
    }

    /// Stops and destroys every resource, then waits for pending writes.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.store.set_autoplay_pending(false);
        inner.adapter.pause();
        inner.registry.stop_all(StopOptions::with_sweep());
        inner
            .registry
            .destroy_external_surfaces(Visibility::Foreground);
        inner.registry.retire_owned();
        inner.adapter.clear();
        inner.persistence.flush().await;

        let pump = inner.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            pump.abort();
        }
        info!("Playback coordinator stopped");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn teardown_resources(&self, options: StopOptions) {
        let inner = &self.inner;
        inner.adapter.pause();
        inner.registry.stop_all(options);
        inner.registry.destroy_external_surfaces(self.visibility());
        inner.registry.retire_owned();
        inner.adapter.clear();
    }

    /// Creates the backend resource of the current source, if any.
    fn load_active(&self) -> Result<Option<MediaHandle>, PlaybackError> {
        let session = self.inner.store.snapshot();
        let Some(source) = session.source_url else {
            return Ok(None);
        };
        let handle = self
            .inner
            .adapter
            .load(&self.inner.registry, &source, session.backend_kind)?;
        debug!(media = %handle, %source, backend = %session.backend_kind, "Loaded source");
        Ok(Some(handle))
    }

    /// Starts playback if a transition left autoplay pending and the backend
    /// can take it now.
    async fn kick_autoplay(&self) {
        let inner = &self.inner;
        if !inner.adapter.is_ready() || !inner.store.take_autoplay_pending() {
            return;
        }
        let outcome = inner.adapter.play().await;
        debug!(?outcome, "Autoplay");
    }

    fn schedule_save(&self) {
        let Some(owner) = self.inner.store.owner() else {
            return;
        };
        let (preferences, version) = self.inner.store.preferences();
        self.inner.persistence.save(owner, preferences, version);
    }

    fn report_backend_error(&self, message: String) {
        let backend = self.inner.store.snapshot().backend_kind;
        self.inner
            .bus
            .publish(PlaybackEvent::Notice(PlaybackNotice::BackendError { backend, message }));
    }
}

async fn pump_media_events(
    inner: Weak<CoordinatorInner>,
    mut events: mpsc::UnboundedReceiver<(MediaHandle, MediaEvent)>,
) {
    while let Some((handle, event)) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        PlaybackCoordinator { inner }
            .handle_media_event(handle, event)
            .await;
    }
    debug!("Media event pump stopped");
}
