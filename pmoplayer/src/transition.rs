//! Serialized track transitions.
//!
//! A transition runs as an explicit state machine:
//!
//! ```text
//! Idle ──try_acquire──▶ Transitioning ──grace window──▶ Idle
//!                            │
//!                            └──failure / timeout──▶ Error ──▶ Idle
//! ```
//!
//! Only one transition may hold the lock. A second request arriving while
//! the lock is held is rejected, never queued.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::BackendAdapter;
use crate::errors::PlaybackError;
use crate::events::{PlaybackEvent, PlaybackNotice};
use crate::model::Visibility;
use crate::registry::{MediaRegistry, StopOptions};
use crate::store::PlaybackStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockState {
    #[default]
    Idle,
    Transitioning,
    Error,
}

/// Identifies the transition currently holding the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransitionTicket(u64);

#[derive(Debug, Default)]
pub struct TransitionLock {
    state: LockState,
    acquired_at: Option<Instant>,
    ticket: Option<TransitionTicket>,
    next_ticket: u64,
    last_failure: Option<String>,
}

pub type SharedTransitionLock = Arc<Mutex<TransitionLock>>;

impl TransitionLock {
    pub fn shared() -> SharedTransitionLock {
        Arc::new(Mutex::new(TransitionLock::default()))
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state != LockState::Transitioning
    }

    pub fn ticket(&self) -> Option<TransitionTicket> {
        self.ticket
    }

    /// How long the current holder has held the lock.
    pub fn held_for(&self) -> Option<Duration> {
        self.acquired_at.map(|at| at.elapsed())
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn try_acquire(&mut self) -> Option<TransitionTicket> {
        if !self.is_idle() {
            return None;
        }
        self.next_ticket += 1;
        let ticket = TransitionTicket(self.next_ticket);
        self.state = LockState::Transitioning;
        self.acquired_at = Some(Instant::now());
        self.ticket = Some(ticket);
        Some(ticket)
    }

    /// Releases the lock if `ticket` still holds it. A stale release is a
    /// no-op and returns false.
    pub fn release(&mut self, ticket: TransitionTicket) -> bool {
        if self.ticket != Some(ticket) {
            return false;
        }
        self.state = LockState::Idle;
        self.acquired_at = None;
        self.ticket = None;
        true
    }

    /// Records a failure of the holder and force-releases to Idle.
    pub fn fail(&mut self, ticket: TransitionTicket, reason: impl Into<String>) -> bool {
        if self.ticket != Some(ticket) {
            return false;
        }
        self.state = LockState::Error;
        self.last_failure = Some(reason.into());
        self.release(ticket)
    }

    /// Whether a source-changing mutation claimed by `claim` may proceed.
    pub fn permits(&self, claim: Option<TransitionTicket>) -> bool {
        self.is_idle() || (claim.is_some() && claim == self.ticket)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionRequest {
    Next,
    Previous,
    JumpTo(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    Switched { index: usize },
    /// Another transition holds the lock.
    Rejected,
    /// Nothing to switch to.
    Empty,
    Failed(String),
}

impl TransitionOutcome {
    pub fn switched(&self) -> Option<usize> {
        match self {
            TransitionOutcome::Switched { index } => Some(*index),
            _ => None,
        }
    }
}

/// Target of `request` in a playlist of `len` entries. `Ok(None)` when the
/// playlist is empty.
pub fn target_index(
    request: TransitionRequest,
    active: usize,
    len: usize,
) -> Result<Option<usize>, PlaybackError> {
    if len == 0 {
        return match request {
            TransitionRequest::JumpTo(index) => Err(PlaybackError::InvalidIndex { index, len }),
            _ => Ok(None),
        };
    }
    let active = active.min(len - 1);
    let target = match request {
        TransitionRequest::Next => (active + 1) % len,
        TransitionRequest::Previous => (active + len - 1) % len,
        TransitionRequest::JumpTo(index) if index < len => index,
        TransitionRequest::JumpTo(index) => {
            return Err(PlaybackError::InvalidIndex { index, len });
        }
    };
    Ok(Some(target))
}

/// Releases the lock when dropped, unless disarmed. Covers early returns
/// and a caller dropping the transition future.
struct LockLease {
    lock: SharedTransitionLock,
    ticket: Option<TransitionTicket>,
}

impl LockLease {
    fn disarm(&mut self) {
        self.ticket = None;
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release(ticket);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransitionTimings {
    pub settle_delay: Duration,
    pub grace: Duration,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct TransitionGuard {
    lock: SharedTransitionLock,
    store: PlaybackStore,
    registry: MediaRegistry,
    adapter: BackendAdapter,
    timings: TransitionTimings,
}

impl TransitionGuard {
    pub fn new(
        lock: SharedTransitionLock,
        store: PlaybackStore,
        registry: MediaRegistry,
        adapter: BackendAdapter,
        timings: TransitionTimings,
    ) -> Self {
        Self {
            lock,
            store,
            registry,
            adapter,
            timings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransitionLock> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_state(&self) -> LockState {
        self.lock().state()
    }

    pub async fn next(&self, visibility: Visibility) -> Result<TransitionOutcome, PlaybackError> {
        self.run(TransitionRequest::Next, visibility).await
    }

    pub async fn previous(
        &self,
        visibility: Visibility,
    ) -> Result<TransitionOutcome, PlaybackError> {
        self.run(TransitionRequest::Previous, visibility).await
    }

    pub async fn jump_to(
        &self,
        index: usize,
        visibility: Visibility,
    ) -> Result<TransitionOutcome, PlaybackError> {
        self.run(TransitionRequest::JumpTo(index), visibility).await
    }

    /// Runs one transition. Only an out-of-range `JumpTo` is an error; every
    /// other failure is reported through the outcome and a bus notice.
    pub async fn run(
        &self,
        request: TransitionRequest,
        visibility: Visibility,
    ) -> Result<TransitionOutcome, PlaybackError> {
        let Some(ticket) = self.lock().try_acquire() else {
            debug!(?request, "Transition already in progress; request rejected");
            return Ok(TransitionOutcome::Rejected);
        };
        let mut lease = LockLease {
            lock: Arc::clone(&self.lock),
            ticket: Some(ticket),
        };

        let Some((active, target, entry)) = self.store.transition_target(request)? else {
            debug!(?request, "Empty playlist; nothing to switch to");
            return Ok(TransitionOutcome::Empty);
        };

        let switch = async {
            let report = self.registry.stop_all(StopOptions::with_sweep());
            let destroyed = self.registry.destroy_external_surfaces(visibility);
            let retired = self.registry.retire_owned();
            self.adapter.clear();
            debug!(?report, destroyed, retired, "Resources torn down");

            tokio::time::sleep(self.timings.settle_delay).await;
            self.store.commit_transition(&entry, target, ticket)
        };

        let committed = match tokio::time::timeout(self.timings.timeout, switch).await {
            Ok(Ok((index, entry))) => {
                self.store.set_autoplay_pending(true);
                info!(from = active, index, source = %entry.url(), "Switched track");
                Ok(index)
            }
            Ok(Err(err)) => {
                error!(index = target, error = %err, "Transition failed");
                Err(err.to_string())
            }
            Err(_) => {
                let err = PlaybackError::TransitionTimeout(self.timings.timeout);
                warn!(index = target, error = %err, "Transition timed out; lock force-released");
                Err(err.to_string())
            }
        };

        lease.disarm();
        let index = match committed {
            Ok(index) => index,
            Err(reason) => {
                self.lock().fail(ticket, reason.clone());
                self.store
                    .bus()
                    .publish(PlaybackEvent::Notice(PlaybackNotice::TransitionFailed {
                        reason: reason.clone(),
                    }));
                return Ok(TransitionOutcome::Failed(reason));
            }
        };

        let lock = Arc::clone(&self.lock);
        let grace = self.timings.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let released = lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release(ticket);
            if released {
                debug!(?ticket, "Transition lock released after grace window");
            }
        });

        Ok(TransitionOutcome::Switched { index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MediaElement, MediaEventSender, MediaHandle, MediaHost, SurfaceEndpoint};
    use crate::config_ext::PlaybackSettings;
    use crate::events::{PlaybackEventBus, Topic};
    use crate::model::PlaylistEntry;

    /// Host with nothing in it; the guard never loads sources itself.
    struct Empty;

    impl MediaHost for Empty {
        fn create_element(
            &self,
            _source: &str,
            _events: MediaEventSender,
        ) -> Result<Arc<dyn MediaElement>, PlaybackError> {
            Err(PlaybackError::host("no elements here"))
        }
        fn embed_surface(&self, _endpoint: SurfaceEndpoint) -> Result<(), PlaybackError> {
            Err(PlaybackError::host("no frames here"))
        }
        fn remove_surface(&self, _handle: MediaHandle) {}
    }

    fn guard(entries: usize, settle_ms: u64) -> TransitionGuard {
        let lock = TransitionLock::shared();
        let store = PlaybackStore::new(
            &PlaybackSettings::default(),
            Arc::clone(&lock),
            PlaybackEventBus::new(),
        );
        let playlist = (0..entries)
            .map(|i| PlaylistEntry::new(format!("https://cdn.example/{i}.mp3"), format!("T{i}")))
            .collect();
        store.set_playlist(playlist, None, None).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = MediaRegistry::new(Arc::new(Empty), tx);
        let adapter = BackendAdapter::new(store.clone(), Duration::from_millis(500));
        TransitionGuard::new(
            lock,
            store,
            registry,
            adapter,
            TransitionTimings {
                settle_delay: Duration::from_millis(settle_ms),
                grace: Duration::from_millis(100),
                timeout: Duration::from_millis(1000),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_follows_entry_removed_before_it() {
        let guard = guard(4, 50);
        guard.store.set_active_index(1, None).unwrap();

        let (outcome, removed) = tokio::join!(guard.next(Visibility::Foreground), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            guard.store.remove_entry(0)
        });
        assert!(!removed.unwrap().1);
        assert_eq!(outcome.unwrap(), TransitionOutcome::Switched { index: 1 });
        assert_eq!(guard.store.active_entry().unwrap().title(), "T2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_target_falls_back_to_its_slot() {
        let guard = guard(4, 50);

        let (outcome, _) = tokio::join!(guard.next(Visibility::Foreground), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            guard.store.remove_entry(1).unwrap();
        });
        assert_eq!(outcome.unwrap(), TransitionOutcome::Switched { index: 1 });
        assert_eq!(guard.store.active_entry().unwrap().title(), "T2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_with_stale_ticket_fails() {
        let guard = guard(3, 50);
        let notices = guard.store.bus().channel();

        let (outcome, newer) = tokio::join!(guard.next(Visibility::Foreground), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut lock = guard.lock();
            let stale = lock.ticket().unwrap();
            assert!(lock.release(stale));
            lock.try_acquire().unwrap()
        });

        assert!(matches!(outcome.unwrap(), TransitionOutcome::Failed(_)));
        assert_eq!(guard.store.active_index(), 0);
        assert!(notices.try_iter().any(|e| e.topic() == Topic::Notice));
        // the failing transition must not free the lock of the newer holder
        assert_eq!(guard.lock_state(), LockState::Transitioning);
        assert!(guard.lock().release(newer));
        assert_eq!(guard.lock_state(), LockState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_records_failure_and_frees_lock() {
        let mut guard = guard(2, 500);
        guard.timings.timeout = Duration::from_millis(100);

        let outcome = guard.next(Visibility::Foreground).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Failed(_)));
        assert_eq!(guard.lock_state(), LockState::Idle);
        assert!(guard.lock().last_failure().is_some());
        assert_eq!(guard.store.active_index(), 0);
    }

    #[test]
    fn test_target_index_wraps() {
        use TransitionRequest::*;
        assert_eq!(target_index(Next, 2, 3).unwrap(), Some(0));
        assert_eq!(target_index(Next, 0, 3).unwrap(), Some(1));
        assert_eq!(target_index(Previous, 0, 3).unwrap(), Some(2));
        assert_eq!(target_index(Previous, 0, 1).unwrap(), Some(0));
        assert_eq!(target_index(Next, 0, 0).unwrap(), None);
        assert_eq!(target_index(JumpTo(1), 0, 3).unwrap(), Some(1));
        assert!(matches!(
            target_index(JumpTo(3), 0, 3),
            Err(PlaybackError::InvalidIndex { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_lock_tickets() {
        let mut lock = TransitionLock::default();
        let first = lock.try_acquire().unwrap();
        assert_eq!(lock.state(), LockState::Transitioning);
        assert!(lock.try_acquire().is_none());
        assert!(lock.permits(Some(first)));
        assert!(!lock.permits(None));

        assert!(lock.release(first));
        let second = lock.try_acquire().unwrap();
        // stale release from the first holder must not free the second
        assert!(!lock.release(first));
        assert_eq!(lock.state(), LockState::Transitioning);

        assert!(lock.fail(second, "boom"));
        assert_eq!(lock.state(), LockState::Idle);
        assert_eq!(lock.last_failure(), Some("boom"));
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let shared = TransitionLock::shared();
        let ticket = shared.lock().unwrap().try_acquire().unwrap();
        drop(LockLease {
            lock: Arc::clone(&shared),
            ticket: Some(ticket),
        });
        assert_eq!(shared.lock().unwrap().state(), LockState::Idle);
    }
}
