//! Registry of every playback resource the engine knows about.
//!
//! Owned elements and embedded surfaces are tracked by [`MediaHandle`]. The
//! registry is the only place where resources are created (through the
//! [`MediaHost`]) and destroyed, so overlapping audio can always be cut from
//! one spot. Elements created elsewhere in the document are reached through
//! an explicit, best-effort ambient sweep.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::backend::{
    ExternalSurface, MediaElement, MediaEvent, MediaEventSender, MediaHandle, MediaHost,
};
use crate::errors::PlaybackError;
use crate::model::Visibility;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Also pause elements that were not created by the registry.
    pub sweep_ambient: bool,
}

impl StopOptions {
    pub fn with_sweep() -> Self {
        Self {
            sweep_ambient: true,
        }
    }
}

/// What a [`MediaRegistry::stop_all`] call touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopReport {
    pub owned: usize,
    pub surfaces: usize,
    pub ambient: usize,
    /// Ambient elements left alone because their tab is in the background.
    pub skipped_background: usize,
}

#[derive(Default)]
struct RegistryState {
    next_handle: u64,
    owned: BTreeMap<MediaHandle, Arc<dyn MediaElement>>,
    surfaces: BTreeMap<MediaHandle, ExternalSurface>,
}

impl RegistryState {
    fn allocate(&mut self) -> MediaHandle {
        self.next_handle += 1;
        MediaHandle(self.next_handle)
    }
}

#[derive(Clone)]
pub struct MediaRegistry {
    host: Arc<dyn MediaHost>,
    state: Arc<Mutex<RegistryState>>,
    events: UnboundedSender<(MediaHandle, MediaEvent)>,
}

impl fmt::Debug for MediaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MediaRegistry")
            .field("owned", &state.owned.keys().collect::<Vec<_>>())
            .field("surfaces", &state.surfaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MediaRegistry {
    /// `events` receives every event reported by resources created here.
    pub fn new(
        host: Arc<dyn MediaHost>,
        events: UnboundedSender<(MediaHandle, MediaEvent)>,
    ) -> Self {
        Self {
            host,
            state: Arc::new(Mutex::new(RegistryState::default())),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking an element the coordinator already owns.
    pub fn track_owned(&self, element: Arc<dyn MediaElement>) -> MediaHandle {
        let mut state = self.state();
        let handle = state.allocate();
        state.owned.insert(handle, element);
        handle
    }

    /// Asks the host for a native element playing `source` and tracks it.
    pub fn create_owned(
        &self,
        source: &str,
    ) -> Result<(MediaHandle, Arc<dyn MediaElement>), PlaybackError> {
        let handle = self.state().allocate();
        let sender = MediaEventSender::new(handle, self.events.clone());
        let element = self.host.create_element(source, sender)?;
        self.state().owned.insert(handle, Arc::clone(&element));
        debug!(element = %handle, source, "Created native element");
        Ok((handle, element))
    }

    /// Asks the host to embed an external surface for `source` and tracks it.
    pub fn create_surface(&self, source: &str) -> Result<ExternalSurface, PlaybackError> {
        let handle = self.state().allocate();
        let sender = MediaEventSender::new(handle, self.events.clone());
        let (surface, endpoint) = ExternalSurface::open(handle, source, sender);
        self.host.embed_surface(endpoint)?;
        self.state().surfaces.insert(handle, surface.clone());
        debug!(surface = %handle, source, "Embedded external surface");
        Ok(surface)
    }

    /// Pauses and rewinds every tracked resource, then optionally sweeps
    /// untracked elements of foreground contexts.
    pub fn stop_all(&self, options: StopOptions) -> StopReport {
        let (owned, surfaces) = {
            let state = self.state();
            (
                state.owned.values().cloned().collect::<Vec<_>>(),
                state.surfaces.values().cloned().collect::<Vec<_>>(),
            )
        };

        let mut report = StopReport::default();
        let mut tracked_ids = HashSet::new();

        for element in &owned {
            element.pause();
            element.reset();
            tracked_ids.insert(element.element_id());
            report.owned += 1;
        }

        for surface in &surfaces {
            // Not ready means it never started; nothing to silence.
            if surface.pause().is_ok() {
                if let Err(err) = surface.seek(0.0) {
                    debug!(surface = %surface.handle(), error = %err, "Rewind failed");
                }
                report.surfaces += 1;
            }
        }

        if options.sweep_ambient {
            for ambient in self.host.ambient_media() {
                if tracked_ids.contains(&ambient.element.element_id()) {
                    continue;
                }
                if ambient.context.is_background() {
                    report.skipped_background += 1;
                    continue;
                }
                ambient.element.pause();
                ambient.element.reset();
                report.ambient += 1;
            }
            if report.ambient > 0 {
                info!(count = report.ambient, "Stopped untracked media elements");
            }
        }

        debug!(?report, "Stopped all media");
        report
    }

    /// Removes embedded surfaces. In the background the surfaces are only
    /// paused and stay tracked until a later foreground call.
    pub fn destroy_external_surfaces(&self, visibility: Visibility) -> usize {
        if visibility.is_background() {
            let surfaces: Vec<_> = self.state().surfaces.values().cloned().collect();
            for surface in &surfaces {
                if let Err(err) = surface.pause() {
                    debug!(surface = %surface.handle(), error = %err, "Surface not paused");
                }
            }
            debug!(count = surfaces.len(), "Background tab: surfaces paused, not destroyed");
            return 0;
        }

        let surfaces = std::mem::take(&mut self.state().surfaces);
        for (handle, surface) in &surfaces {
            if let Err(err) = surface.pause() {
                debug!(surface = %handle, error = %err, "Surface not paused before removal");
            }
            self.host.remove_surface(*handle);
        }
        if !surfaces.is_empty() {
            debug!(count = surfaces.len(), "Destroyed external surfaces");
        }
        surfaces.len()
    }

    /// Releases every owned element and stops tracking it.
    pub fn retire_owned(&self) -> usize {
        let owned = std::mem::take(&mut self.state().owned);
        for element in owned.values() {
            element.pause();
            element.release();
        }
        owned.len()
    }

    /// Stops tracking `handle` without touching the resource.
    pub fn untrack(&self, handle: MediaHandle) -> bool {
        let mut state = self.state();
        state.owned.remove(&handle).is_some() || state.surfaces.remove(&handle).is_some()
    }

    pub fn is_tracked(&self, handle: MediaHandle) -> bool {
        let state = self.state();
        state.owned.contains_key(&handle) || state.surfaces.contains_key(&handle)
    }

    pub fn owned_count(&self) -> usize {
        self.state().owned.len()
    }

    pub fn surface_count(&self) -> usize {
        self.state().surfaces.len()
    }

    /// Tracked or ambient elements currently producing sound. Surfaces are
    /// opaque and not counted.
    pub fn audible_count(&self) -> usize {
        let owned: Vec<_> = self.state().owned.values().cloned().collect();
        let tracked_ids: HashSet<String> = owned.iter().map(|el| el.element_id()).collect();
        let tracked = owned.iter().filter(|el| el.is_audible()).count();
        let ambient = self
            .host
            .ambient_media()
            .into_iter()
            .filter(|a| !tracked_ids.contains(&a.element.element_id()))
            .filter(|a| a.element.is_audible())
            .count();
        if tracked + ambient > 1 {
            warn!(tracked, ambient, "More than one audible media resource");
        }
        tracked + ambient
    }
}
