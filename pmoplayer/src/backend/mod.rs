//! Playback backends and the host seam.
//!
//! Two engines can render a source:
//! - a native media element, created by the host and owned by the coordinator
//!   ([`MediaElement`]),
//! - an external surface embedded by the host and driven by asynchronous
//!   messages ([`ExternalSurface`]).
//!
//! The host (browser shell, webview, test harness) implements [`MediaHost`];
//! nothing else in the crate knows how resources are physically created.

mod adapter;
mod external;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

pub use adapter::{BackendAdapter, PlayOutcome};
pub use external::{ExternalSurface, SurfaceCommand, SurfaceEndpoint};

use crate::errors::PlaybackError;
use crate::model::{BackendKind, Visibility};

/// Registry-assigned identity of a playback resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediaHandle(pub(crate) u64);

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media#{}", self.0)
    }
}

/// Events a backend reports back to the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaEvent {
    Ready,
    Progress {
        current_time: f64,
        duration: Option<f64>,
    },
    Ended,
    Error(String),
}

/// Sending half handed to the host for one resource. Every event is tagged
/// with the resource handle so late events of a retired resource can be
/// told apart from the active one.
#[derive(Clone, Debug)]
pub struct MediaEventSender {
    handle: MediaHandle,
    tx: UnboundedSender<(MediaHandle, MediaEvent)>,
}

impl MediaEventSender {
    pub(crate) fn new(handle: MediaHandle, tx: UnboundedSender<(MediaHandle, MediaEvent)>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> MediaHandle {
        self.handle
    }

    /// Returns false once the coordinator is gone.
    pub fn send(&self, event: MediaEvent) -> bool {
        self.tx.send((self.handle, event)).is_ok()
    }
}

/// A playback-capable element living in the host document.
#[async_trait]
pub trait MediaElement: Send + Sync + fmt::Debug {
    /// Stable host identity (DOM id or equivalent), used to tell tracked
    /// elements apart from ambient ones.
    fn element_id(&self) -> String;

    /// Starts playback. Must fail with [`PlaybackError::PlaybackRejected`]
    /// when the platform blocks autoplay.
    async fn play(&self) -> Result<(), PlaybackError>;

    fn pause(&self);

    /// Rewinds to the start.
    fn reset(&self);

    fn seek(&self, seconds: f64);

    fn set_volume(&self, volume: f64);

    /// True while the element is producing sound.
    fn is_audible(&self) -> bool;

    /// Detaches the element from the document; it is never used again.
    fn release(&self);
}

/// Playback element found in the document but not created by us.
#[derive(Clone, Debug)]
pub struct AmbientMedia {
    pub element: Arc<dyn MediaElement>,
    /// Visibility of the tab context the element belongs to.
    pub context: Visibility,
}

/// Platform seam used by the registry to create and destroy resources.
pub trait MediaHost: Send + Sync {
    fn create_element(
        &self,
        source: &str,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaElement>, PlaybackError>;

    /// Embeds a third-party player for `endpoint.source()`. The host forwards
    /// `endpoint` commands to the frame and reports its events back.
    fn embed_surface(&self, endpoint: SurfaceEndpoint) -> Result<(), PlaybackError>;

    fn remove_surface(&self, handle: MediaHandle);

    /// Playback elements present in the document, tracked or not.
    fn ambient_media(&self) -> Vec<AmbientMedia> {
        Vec::new()
    }
}

/// Decides which backend renders a URL.
#[derive(Clone, Debug, Default)]
pub struct SourceClassifier {
    external_hosts: Vec<String>,
}

impl SourceClassifier {
    pub fn new<I, S>(external_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            external_hosts: external_hosts
                .into_iter()
                .map(|h| h.into().trim().trim_start_matches('.').to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, source: &str) -> BackendKind {
        let Ok(url) = Url::parse(source) else {
            return BackendKind::Native;
        };
        let Some(host) = url.host_str().map(str::to_lowercase) else {
            return BackendKind::Native;
        };

        let external = self.external_hosts.iter().any(|known| {
            host == *known
                || host
                    .strip_suffix(known.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        });

        if external {
            BackendKind::External
        } else {
            BackendKind::Native
        }
    }
}
