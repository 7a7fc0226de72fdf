use std::time::Duration;

use thiserror::Error;

use crate::model::BackendKind;

#[derive(Error, Debug)]
pub enum PlaybackError {
    /// The backend exists but has not signalled readiness yet.
    #[error("{0} backend is not ready")]
    BackendUnavailable(BackendKind),
    /// Platform policy refused audible playback without a user gesture.
    #[error("Playback rejected by platform policy: user gesture required")]
    PlaybackRejected,
    #[error("A track transition is in progress")]
    TransitionInProgress,
    #[error("Transition did not complete within {0:?}")]
    TransitionTimeout(Duration),
    #[error("Index {index} out of bounds for a playlist of {len} entries")]
    InvalidIndex { index: usize, len: usize },
    #[error("Playlist is full ({0} entries)")]
    PlaylistFull(usize),
    #[error("Host error: {0}")]
    Host(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl PlaybackError {
    pub fn host(message: impl Into<String>) -> Self {
        PlaybackError::Host(message.into())
    }
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Anonymous sessions have nowhere to persist; callers treat this as benign.
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("Persistence backend error: {0}")]
    Backend(String),
    #[error("Cannot encode preferences: {0}")]
    Serialization(#[from] serde_json::Error),
}
