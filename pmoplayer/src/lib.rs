//! # pmoplayer - Moteur de coordination de lecture
//!
//! Cette crate décide de ce qui est audible à chaque instant, quel que soit
//! le moteur de rendu :
//! - un élément média natif créé par l'hôte,
//! - un lecteur tiers embarqué, piloté par messages asynchrones.
//!
//! # Architecture
//!
//! - **PlaybackCoordinator** : façade publique, une instance par page/onglet
//! - **BackendAdapter** : contrat play/pause/seek/volume uniforme
//! - **MediaRegistry** : suivi et arrêt forcé de toutes les ressources
//! - **PlaybackStore** : source de vérité unique de l'état de lecture
//! - **TransitionGuard** : changements de piste sérialisés
//! - **PersistenceBridge** : sauvegarde versionnée et temporisée des préférences
//! - **PlaybackEventBus** : diffusion des changements d'état
//!
//! # Exemple d'utilisation
//!
//! ```no_run
//! use std::sync::Arc;
//! use pmoplayer::{
//!     MemoryPreferenceStore, MediaHost, OwnerId, PlaybackConfigExt, PlaybackCoordinator,
//!     PlaylistEntry, Topic,
//! };
//!
//! # async fn run(host: Arc<dyn MediaHost>) -> Result<(), pmoplayer::PlaybackError> {
//! let config = pmoconfig::get_config().map_err(|e| pmoplayer::PlaybackError::host(e.to_string()))?;
//! let player = PlaybackCoordinator::new(
//!     config.playback_settings(),
//!     host,
//!     Arc::new(MemoryPreferenceStore::new()),
//! );
//!
//! player.subscribe(Topic::TrackChanged, |event| println!("{event:?}"));
//! player.start_session(Some(OwnerId::new("alice"))).await?;
//! player.set_playlist(
//!     vec![
//!         PlaylistEntry::new("https://cdn.example.org/a.mp3", "A"),
//!         PlaylistEntry::new("https://www.youtube.com/watch?v=b", "B"),
//!     ],
//!     None,
//! )?;
//! player.play().await?;
//! player.next().await?;
//! player.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod config_ext;
mod coordinator;
mod errors;
mod events;
mod model;
mod persistence;
mod registry;
mod store;
mod transition;

// Réexports publics
pub use backend::{
    AmbientMedia, BackendAdapter, ExternalSurface, MediaElement, MediaEvent, MediaEventSender,
    MediaHandle, MediaHost, PlayOutcome, SourceClassifier, SurfaceCommand, SurfaceEndpoint,
};
pub use config_ext::{PlaybackConfigExt, PlaybackSettings};
pub use coordinator::PlaybackCoordinator;
pub use errors::{PersistenceError, PlaybackError};
pub use events::{Listener, PlaybackEvent, PlaybackEventBus, PlaybackNotice, SubscriptionId, Topic};
pub use model::{
    BackendKind, OwnerId, PlaybackPreferences, PlaybackSession, Playlist, PlaylistEntry,
    Visibility, clamp_volume,
};
pub use persistence::{MemoryPreferenceStore, PersistenceBridge, PreferenceStore, SaveDisposition};
pub use registry::{MediaRegistry, StopOptions, StopReport};
pub use store::{PlaybackStore, TransportUpdate};
pub use transition::{
    LockState, TransitionGuard, TransitionLock, TransitionOutcome, TransitionRequest,
    TransitionTicket, TransitionTimings, target_index,
};

pub type Result<T> = std::result::Result<T, PlaybackError>;
