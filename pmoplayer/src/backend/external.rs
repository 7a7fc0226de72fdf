//! Externally embedded playback surface.
//!
//! The surface is a third-party player living in its own frame. We only
//! talk to it through messages: commands go out on a channel drained by the
//! host, events come back through a [`MediaEventSender`]. Until the surface
//! reports `Ready`, every command is refused with `BackendUnavailable`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::backend::{MediaEventSender, MediaHandle};
use crate::errors::PlaybackError;
use crate::model::{BackendKind, clamp_volume};

/// Commands sent to the embedded player.
#[derive(Clone, Debug, PartialEq)]
pub enum SurfaceCommand {
    Play,
    Pause,
    Seek(f64),
    SetVolume(f64),
}

/// Host side of a surface: what the frame integration needs to drive it.
#[derive(Debug)]
pub struct SurfaceEndpoint {
    handle: MediaHandle,
    source: String,
    commands: mpsc::UnboundedReceiver<SurfaceCommand>,
    events: MediaEventSender,
}

impl SurfaceEndpoint {
    pub fn handle(&self) -> MediaHandle {
        self.handle
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn events(&self) -> &MediaEventSender {
        &self.events
    }

    /// Next command for the frame, `None` once the surface is dropped.
    pub async fn next_command(&mut self) -> Option<SurfaceCommand> {
        self.commands.recv().await
    }

    pub fn try_next_command(&mut self) -> Option<SurfaceCommand> {
        self.commands.try_recv().ok()
    }

    pub fn into_parts(
        self,
    ) -> (
        MediaHandle,
        String,
        mpsc::UnboundedReceiver<SurfaceCommand>,
        MediaEventSender,
    ) {
        (self.handle, self.source, self.commands, self.events)
    }
}

/// Coordinator side of a surface.
#[derive(Clone, Debug)]
pub struct ExternalSurface {
    handle: MediaHandle,
    source: String,
    commands: mpsc::UnboundedSender<SurfaceCommand>,
    ready: Arc<watch::Sender<bool>>,
}

impl ExternalSurface {
    /// Creates both halves of a surface for `source`.
    pub(crate) fn open(
        handle: MediaHandle,
        source: &str,
        events: MediaEventSender,
    ) -> (Self, SurfaceEndpoint) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(false);
        let surface = ExternalSurface {
            handle,
            source: source.to_string(),
            commands: tx,
            ready: Arc::new(ready),
        };
        let endpoint = SurfaceEndpoint {
            handle,
            source: source.to_string(),
            commands: rx,
            events,
        };
        (surface, endpoint)
    }

    pub fn handle(&self) -> MediaHandle {
        self.handle
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Capability flag that flips to `true` once the frame reports `Ready`.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub(crate) fn mark_ready(&self) {
        if !self.ready.send_replace(true) {
            debug!(surface = %self.handle, "External surface ready");
        }
    }

    /// Waits up to `timeout` for readiness.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        let mut rx = self.ready.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }

    fn send(&self, command: SurfaceCommand) -> Result<(), PlaybackError> {
        if !self.is_ready() {
            return Err(PlaybackError::BackendUnavailable(BackendKind::External));
        }
        self.commands
            .send(command)
            .map_err(|_| PlaybackError::host(format!("surface {} is gone", self.handle)))
    }

    pub fn play(&self) -> Result<(), PlaybackError> {
        self.send(SurfaceCommand::Play)
    }

    pub fn pause(&self) -> Result<(), PlaybackError> {
        self.send(SurfaceCommand::Pause)
    }

    pub fn seek(&self, seconds: f64) -> Result<(), PlaybackError> {
        self.send(SurfaceCommand::Seek(seconds.max(0.0)))
    }

    pub fn set_volume(&self, volume: f64) -> Result<(), PlaybackError> {
        self.send(SurfaceCommand::SetVolume(clamp_volume(volume)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_surface() -> (ExternalSurface, SurfaceEndpoint) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let events = MediaEventSender::new(MediaHandle(1), tx);
        ExternalSurface::open(MediaHandle(1), "https://youtube.com/watch?v=x", events)
    }

    #[test]
    fn test_commands_refused_before_ready() {
        let (surface, mut endpoint) = open_surface();
        assert!(matches!(
            surface.play(),
            Err(PlaybackError::BackendUnavailable(BackendKind::External))
        ));
        assert!(surface.pause().is_err());
        assert!(surface.seek(10.0).is_err());
        assert!(endpoint.try_next_command().is_none());
    }

    #[test]
    fn test_commands_forwarded_once_ready() {
        let (surface, mut endpoint) = open_surface();
        surface.mark_ready();
        surface.play().unwrap();
        surface.set_volume(1.7).unwrap();
        surface.seek(-3.0).unwrap();

        assert_eq!(endpoint.try_next_command(), Some(SurfaceCommand::Play));
        assert_eq!(
            endpoint.try_next_command(),
            Some(SurfaceCommand::SetVolume(1.0))
        );
        assert_eq!(endpoint.try_next_command(), Some(SurfaceCommand::Seek(0.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out() {
        let (surface, _endpoint) = open_surface();
        assert!(!surface.wait_ready(Duration::from_millis(200)).await);

        let waiter = surface.clone();
        let task = tokio::spawn(async move { waiter.wait_ready(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        surface.mark_ready();
        assert!(task.await.unwrap());
    }

    #[test]
    fn test_dropped_endpoint_reports_host_error() {
        let (surface, endpoint) = open_surface();
        surface.mark_ready();
        drop(endpoint);
        assert!(matches!(surface.play(), Err(PlaybackError::Host(_))));
    }
}
