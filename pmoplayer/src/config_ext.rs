//! Extension de pmoconfig pour le moteur de lecture

use std::time::Duration;

const DEFAULT_EXTERNAL_HOSTS: [&str; 4] = ["youtube.com", "youtu.be", "soundcloud.com", "vimeo.com"];
const DEFAULT_READY_RETRY_MS: u64 = 500;
const DEFAULT_SETTLE_DELAY_MS: u64 = 150;
const DEFAULT_GRACE_MS: u64 = 1500;
const DEFAULT_TRANSITION_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_ENTRIES: u64 = 500;
const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 300;
const DEFAULT_VOLUME: f64 = 0.8;

/// Tunables of the playback engine.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSettings {
    /// URL hosts rendered by an embedded surface (suffix match).
    pub external_hosts: Vec<String>,
    /// How long `play()` waits for a not-yet-ready surface before falling back.
    pub ready_retry: Duration,
    /// Pause between tearing down old resources and creating the new one.
    pub settle_delay: Duration,
    /// Fixed hold time of the transition lock after a switch.
    pub grace: Duration,
    /// Upper bound on the teardown/update steps of a transition.
    pub transition_timeout: Duration,
    pub max_playlist_entries: usize,
    pub save_debounce: Duration,
    pub default_volume: f64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            external_hosts: DEFAULT_EXTERNAL_HOSTS.iter().map(|h| h.to_string()).collect(),
            ready_retry: Duration::from_millis(DEFAULT_READY_RETRY_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            transition_timeout: Duration::from_millis(DEFAULT_TRANSITION_TIMEOUT_MS),
            max_playlist_entries: DEFAULT_MAX_ENTRIES as usize,
            save_debounce: Duration::from_millis(DEFAULT_SAVE_DEBOUNCE_MS),
            default_volume: DEFAULT_VOLUME,
        }
    }
}

/// Trait d'extension pour pmoconfig::Config
pub trait PlaybackConfigExt {
    /// Lit la section `playback` ; les clés absentes prennent leur valeur par défaut.
    fn playback_settings(&self) -> PlaybackSettings;
}

impl PlaybackConfigExt for pmoconfig::Config {
    fn playback_settings(&self) -> PlaybackSettings {
        let ms = |path: &[&str], default: u64| Duration::from_millis(self.get_u64(path, default));

        let mut external_hosts = self.get_string_list(&["playback", "backend", "external_hosts"]);
        if external_hosts.is_empty() {
            external_hosts = PlaybackSettings::default().external_hosts;
        }

        PlaybackSettings {
            external_hosts,
            ready_retry: ms(&["playback", "backend", "ready_retry_ms"], DEFAULT_READY_RETRY_MS),
            settle_delay: ms(
                &["playback", "transition", "settle_delay_ms"],
                DEFAULT_SETTLE_DELAY_MS,
            ),
            grace: ms(&["playback", "transition", "grace_ms"], DEFAULT_GRACE_MS),
            transition_timeout: ms(
                &["playback", "transition", "timeout_ms"],
                DEFAULT_TRANSITION_TIMEOUT_MS,
            ),
            max_playlist_entries: self
                .get_u64(&["playback", "playlist", "max_entries"], DEFAULT_MAX_ENTRIES)
                .max(1) as usize,
            save_debounce: ms(
                &["playback", "persistence", "debounce_ms"],
                DEFAULT_SAVE_DEBOUNCE_MS,
            ),
            default_volume: crate::model::clamp_volume(
                self.get_f64(&["playback", "volume", "default"], DEFAULT_VOLUME),
            ),
        }
    }
}
