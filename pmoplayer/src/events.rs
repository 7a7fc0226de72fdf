//! Topic-based fan-out of playback state changes.
//!
//! The bus knows nothing about its listeners: page controls, the mini
//! player widget and the coordinator itself only share this type, never
//! each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::model::{BackendKind, OwnerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    PlayingChanged,
    TrackChanged,
    PlaylistChanged,
    VolumeChanged,
    TransportProgress,
    Notice,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::PlayingChanged => "playing-changed",
            Topic::TrackChanged => "track-changed",
            Topic::PlaylistChanged => "playlist-changed",
            Topic::VolumeChanged => "volume-changed",
            Topic::TransportProgress => "transport-progress",
            Topic::Notice => "notice",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-blocking conditions the UI may want to surface.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaybackNotice {
    /// Audible playback was refused until the user interacts with the page.
    NeedsUserGesture,
    PersistenceFailed { owner: OwnerId, reason: String },
    TransitionFailed { reason: String },
    BackendError { backend: BackendKind, message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlaybackEvent {
    PlayingChanged {
        playing: bool,
    },
    TrackChanged {
        index: usize,
        source_url: Option<String>,
        title: Option<String>,
        backend: BackendKind,
    },
    PlaylistChanged {
        len: usize,
        active_index: usize,
        version: u64,
    },
    VolumeChanged {
        volume: f64,
    },
    TransportProgress {
        current_time: f64,
        duration: Option<f64>,
    },
    Notice(PlaybackNotice),
}

impl PlaybackEvent {
    pub fn topic(&self) -> Topic {
        match self {
            PlaybackEvent::PlayingChanged { .. } => Topic::PlayingChanged,
            PlaybackEvent::TrackChanged { .. } => Topic::TrackChanged,
            PlaybackEvent::PlaylistChanged { .. } => Topic::PlaylistChanged,
            PlaybackEvent::VolumeChanged { .. } => Topic::VolumeChanged,
            PlaybackEvent::TransportProgress { .. } => Topic::TransportProgress,
            PlaybackEvent::Notice(_) => Topic::Notice,
        }
    }
}

/// Token returned by [`PlaybackEventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Listener = Arc<dyn Fn(&PlaybackEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    listeners: RwLock<HashMap<u64, (Topic, Listener)>>,
    counter: AtomicU64,
    channels: Mutex<Vec<Sender<PlaybackEvent>>>,
}

#[derive(Clone, Default)]
pub struct PlaybackEventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for PlaybackEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackEventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl PlaybackEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for a single topic.
    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&PlaybackEvent) + Send + Sync + 'static,
    {
        let token = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, (topic, Arc::new(listener)));
        SubscriptionId(token)
    }

    /// Returns false when the token was unknown (already unsubscribed).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0)
            .is_some()
    }

    /// Receiver of every event, whatever its topic. Dropping the receiver
    /// is enough to unsubscribe.
    pub fn channel(&self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = unbounded::<PlaybackEvent>();
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: PlaybackEvent) {
        let topic = event.topic();
        // Listeners may subscribe/unsubscribe from inside the callback.
        let targets: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(t, _)| *t == topic)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in targets {
            listener(&event);
        }

        let mut channels = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        channels.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn publish_all(&self, events: Vec<PlaybackEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}
