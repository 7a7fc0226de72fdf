//! Uniform transport contract over the native element and the external
//! surface.
//!
//! The adapter never decides *what* plays; it only routes transport calls to
//! whichever backend is installed and ready, and mirrors successful calls
//! into the store (which notifies the bus).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backend::{ExternalSurface, MediaElement, MediaHandle};
use crate::errors::PlaybackError;
use crate::model::{BackendKind, clamp_volume};
use crate::registry::MediaRegistry;
use crate::store::{PlaybackStore, TransportUpdate};

/// Result of a `play()` request. None of these is an error for the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayOutcome {
    Started(BackendKind),
    /// The platform refused to start audio without a user gesture.
    NeedsUserGesture,
    /// No backend is installed, or none became ready in time.
    Unavailable,
}

impl PlayOutcome {
    pub fn started(self) -> bool {
        matches!(self, PlayOutcome::Started(_))
    }
}

#[derive(Debug, Default)]
struct AdapterSlots {
    native: Option<(MediaHandle, Arc<dyn MediaElement>)>,
    external: Option<ExternalSurface>,
}

#[derive(Clone)]
pub struct BackendAdapter {
    slots: Arc<Mutex<AdapterSlots>>,
    store: PlaybackStore,
    ready_retry: Duration,
}

impl fmt::Debug for BackendAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendAdapter")
            .field("slots", &*self.slots())
            .field("ready_retry", &self.ready_retry)
            .finish()
    }
}

impl BackendAdapter {
    pub fn new(store: PlaybackStore, ready_retry: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(AdapterSlots::default())),
            store,
            ready_retry,
        }
    }

    fn slots(&self) -> MutexGuard<'_, AdapterSlots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> (Option<Arc<dyn MediaElement>>, Option<ExternalSurface>) {
        let slots = self.slots();
        (
            slots.native.as_ref().map(|(_, el)| Arc::clone(el)),
            slots.external.clone(),
        )
    }

    /// Installs an external surface and returns its readiness capability.
    pub fn register_external(&self, surface: ExternalSurface) -> watch::Receiver<bool> {
        let ready = surface.ready_signal();
        debug!(surface = %surface.handle(), source = surface.source(), "Registering external surface");
        self.slots().external = Some(surface);
        ready
    }

    pub fn install_native(&self, handle: MediaHandle, element: Arc<dyn MediaElement>) {
        element.set_volume(self.store.volume());
        debug!(element = %handle, "Installing native element");
        self.slots().native = Some((handle, element));
    }

    /// Creates the resource for `source` through the registry and installs
    /// it. The registry is the only component allowed to create resources.
    pub fn load(
        &self,
        registry: &MediaRegistry,
        source: &str,
        kind: BackendKind,
    ) -> Result<MediaHandle, PlaybackError> {
        match kind {
            BackendKind::Native => {
                let (handle, element) = registry.create_owned(source)?;
                self.install_native(handle, element);
                Ok(handle)
            }
            BackendKind::External => {
                let surface = registry.create_surface(source)?;
                let handle = surface.handle();
                self.register_external(surface);
                Ok(handle)
            }
        }
    }

    /// Forgets both backends. Resources themselves are the registry's business.
    pub fn clear(&self) {
        let mut slots = self.slots();
        slots.native = None;
        slots.external = None;
    }

    pub fn has_backend(&self) -> bool {
        let slots = self.slots();
        slots.native.is_some() || slots.external.is_some()
    }

    /// True when `handle` is the installed native element or surface.
    pub fn is_current(&self, handle: MediaHandle) -> bool {
        let slots = self.slots();
        slots.native.as_ref().is_some_and(|(h, _)| *h == handle)
            || slots.external.as_ref().is_some_and(|s| s.handle() == handle)
    }

    /// Backend that transport calls are routed to right now.
    pub fn active_kind(&self) -> Option<BackendKind> {
        let slots = self.slots();
        match (&slots.external, &slots.native) {
            (Some(surface), _) if surface.is_ready() => Some(BackendKind::External),
            (_, Some(_)) => Some(BackendKind::Native),
            _ => None,
        }
    }

    /// True when a call to `play()` would not have to wait for readiness.
    pub fn is_ready(&self) -> bool {
        self.active_kind().is_some()
    }

    /// Flags the installed surface as ready and applies the current volume.
    pub fn mark_external_ready(&self, handle: MediaHandle) -> bool {
        let Some(surface) = self.slots().external.clone() else {
            return false;
        };
        if surface.handle() != handle {
            return false;
        }
        surface.mark_ready();
        if let Err(err) = surface.set_volume(self.store.volume()) {
            debug!(surface = %handle, error = %err, "Cannot push volume to surface");
        }
        true
    }

    pub async fn play(&self) -> PlayOutcome {
        let (native, external) = self.current();

        if let Some(surface) = external {
            if surface.is_ready() || surface.wait_ready(self.ready_retry).await {
                match surface.play() {
                    Ok(()) => {
                        self.mark_started();
                        return PlayOutcome::Started(BackendKind::External);
                    }
                    Err(err) => warn!(surface = %surface.handle(), error = %err, "External play failed"),
                }
            } else {
                debug!(
                    surface = %surface.handle(),
                    retry = ?self.ready_retry,
                    "External surface still not ready; falling back to native"
                );
            }
        }

        let Some(element) = native else {
            return PlayOutcome::Unavailable;
        };

        match element.play().await {
            Ok(()) => {
                self.mark_started();
                PlayOutcome::Started(BackendKind::Native)
            }
            Err(PlaybackError::PlaybackRejected) => {
                debug!("Native play rejected by autoplay policy");
                self.store.set_needs_user_gesture(true);
                PlayOutcome::NeedsUserGesture
            }
            Err(err) => {
                warn!(error = %err, "Native play failed");
                PlayOutcome::Unavailable
            }
        }
    }

    fn mark_started(&self) {
        self.store.set_needs_user_gesture(false);
        self.store.set_playing(true);
    }

    /// Idempotent; succeeds whatever the backend state.
    pub fn pause(&self) {
        let (native, external) = self.current();
        if let Some(element) = native {
            element.pause();
        }
        if let Some(surface) = external {
            if let Err(err) = surface.pause() {
                debug!(surface = %surface.handle(), error = %err, "Pause ignored by surface");
            }
        }
        self.store.set_playing(false);
    }

    /// Seeks the active backend. Returns false when nothing could be seeked.
    pub fn seek_to(&self, seconds: f64) -> bool {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        let (native, external) = self.current();

        let routed = match (external, native) {
            (Some(surface), _) if surface.is_ready() => surface.seek(seconds).is_ok(),
            (_, Some(element)) => {
                element.seek(seconds);
                true
            }
            _ => false,
        };

        if routed {
            self.store.set_transport(TransportUpdate {
                current_time: Some(seconds),
                ..TransportUpdate::default()
            });
        }
        routed
    }

    /// Clamps, stores and forwards the volume. The stored value changes even
    /// when no backend is ready so the preference is never lost.
    pub fn set_volume(&self, volume: f64) -> f64 {
        let volume = clamp_volume(volume);
        let (native, external) = self.current();
        if let Some(element) = native {
            element.set_volume(volume);
        }
        if let Some(surface) = external.filter(|s| s.is_ready()) {
            if let Err(err) = surface.set_volume(volume) {
                debug!(surface = %surface.handle(), error = %err, "Volume ignored by surface");
            }
        }
        self.store.set_volume(volume)
    }
}
