//! Durable playback preferences.
//!
//! The bridge mirrors the store's durable fields into a [`PreferenceStore`]
//! backend. Writes are debounced and versioned per owner: at most one write
//! is in flight for an owner, newer snapshots replace the pending one, and
//! the writer loops until the newest observed version has been written.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::errors::PersistenceError;
use crate::events::{PlaybackEvent, PlaybackEventBus, PlaybackNotice};
use crate::model::{OwnerId, PlaybackPreferences};

/// Save/load contract of the persistence backend.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn save(
        &self,
        owner: &OwnerId,
        preferences: &PlaybackPreferences,
    ) -> Result<(), PersistenceError>;

    /// Anonymous callers get `Ok(None)`.
    async fn load(&self, owner: &OwnerId) -> Result<Option<PlaybackPreferences>, PersistenceError>;
}

/// In-memory backend keeping one JSON document per owner.
#[derive(Debug)]
pub struct MemoryPreferenceStore {
    documents: Mutex<HashMap<OwnerId, String>>,
    authenticated: AtomicBool,
    failing: AtomicBool,
    write_delay: Duration,
    writes: AtomicUsize,
}

impl Default for MemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            authenticated: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            write_delay: Duration::ZERO,
            writes: AtomicUsize::new(0),
        }
    }

    /// Simulates backend latency on every write.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Makes every subsequent write fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<OwnerId, String>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw stored document of `owner`.
    pub fn document(&self, owner: &OwnerId) -> Option<String> {
        self.documents().get(owner).cloned()
    }

    pub fn insert_document(&self, owner: &OwnerId, preferences: &PlaybackPreferences) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(preferences)?;
        self.documents().insert(owner.clone(), json);
        Ok(())
    }

    /// Completed writes, successful or not.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn save(
        &self,
        owner: &OwnerId,
        preferences: &PlaybackPreferences,
    ) -> Result<(), PersistenceError> {
        if !self.authenticated.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unauthenticated);
        }
        let json = serde_json::to_string(preferences)?;
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("storage unavailable".to_string()));
        }
        self.documents().insert(owner.clone(), json);
        Ok(())
    }

    async fn load(&self, owner: &OwnerId) -> Result<Option<PlaybackPreferences>, PersistenceError> {
        if !self.authenticated.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.document(owner) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// What [`PersistenceBridge::save`] did with a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveDisposition {
    /// Older than or equal to a version already observed.
    Stale,
    /// A write is in flight; the snapshot will be written after it.
    Coalesced,
    /// A writer was started for the snapshot.
    Started,
}

#[derive(Debug, Default)]
struct SaveSlot {
    observed: u64,
    persisted: u64,
    in_flight: bool,
    pending: Option<(u64, PlaybackPreferences)>,
}

struct BridgeInner {
    backend: Arc<dyn PreferenceStore>,
    debounce: Duration,
    slots: Mutex<HashMap<OwnerId, SaveSlot>>,
    idle: Notify,
    bus: PlaybackEventBus,
}

#[derive(Clone)]
pub struct PersistenceBridge {
    inner: Arc<BridgeInner>,
}

impl fmt::Debug for PersistenceBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceBridge")
            .field("debounce", &self.inner.debounce)
            .field("slots", &*self.slots())
            .finish()
    }
}

impl PersistenceBridge {
    pub fn new(backend: Arc<dyn PreferenceStore>, debounce: Duration, bus: PlaybackEventBus) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                backend,
                debounce,
                slots: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                bus,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<OwnerId, SaveSlot>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules `preferences` (at `version`) for `owner`. Must be called
    /// from within a tokio runtime.
    pub fn save(
        &self,
        owner: OwnerId,
        preferences: PlaybackPreferences,
        version: u64,
    ) -> SaveDisposition {
        {
            let mut slots = self.slots();
            let slot = slots.entry(owner.clone()).or_default();
            if version <= slot.observed {
                debug!(%owner, version, observed = slot.observed, "Ignoring stale preferences");
                return SaveDisposition::Stale;
            }
            slot.observed = version;
            slot.pending = Some((version, preferences));
            if slot.in_flight {
                debug!(%owner, version, "Write in flight; preferences queued");
                return SaveDisposition::Coalesced;
            }
            slot.in_flight = true;
        }

        let bridge = self.clone();
        tokio::spawn(async move { bridge.write_loop(owner).await });
        SaveDisposition::Started
    }

    async fn write_loop(self, owner: OwnerId) {
        tokio::time::sleep(self.inner.debounce).await;

        loop {
            let next = {
                let mut slots = self.slots();
                let slot = slots.entry(owner.clone()).or_default();
                match slot.pending.take() {
                    Some(next) => next,
                    None => {
                        slot.in_flight = false;
                        break;
                    }
                }
            };
            let (version, preferences) = next;

            match self.inner.backend.save(&owner, &preferences).await {
                Ok(()) => {
                    debug!(%owner, version, "Preferences persisted");
                    if let Some(slot) = self.slots().get_mut(&owner) {
                        slot.persisted = slot.persisted.max(version);
                    }
                }
                Err(PersistenceError::Unauthenticated) => {
                    debug!(%owner, "Anonymous session; preferences kept in memory only");
                }
                Err(err) => {
                    warn!(%owner, version, error = %err, "Cannot persist preferences");
                    self.inner
                        .bus
                        .publish(PlaybackEvent::Notice(PlaybackNotice::PersistenceFailed {
                            owner: owner.clone(),
                            reason: err.to_string(),
                        }));
                }
            }
        }

        self.inner.idle.notify_waiters();
    }

    /// Durable preferences of `owner`. Failures are logged and read as `None`.
    pub async fn load(&self, owner: &OwnerId) -> Option<PlaybackPreferences> {
        match self.inner.backend.load(owner).await {
            Ok(preferences) => preferences,
            Err(PersistenceError::Unauthenticated) => {
                debug!(%owner, "Anonymous session; no stored preferences");
                None
            }
            Err(err) => {
                warn!(%owner, error = %err, "Cannot load preferences");
                self.inner
                    .bus
                    .publish(PlaybackEvent::Notice(PlaybackNotice::PersistenceFailed {
                        owner: owner.clone(),
                        reason: err.to_string(),
                    }));
                None
            }
        }
    }

    /// Highest version successfully written for `owner`.
    pub fn persisted_version(&self, owner: &OwnerId) -> u64 {
        self.slots().get(owner).map_or(0, |slot| slot.persisted)
    }

    pub fn is_idle(&self) -> bool {
        !self.slots().values().any(|slot| slot.in_flight)
    }

    /// Waits until no writer is running for any owner.
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
