//! Démonstration du moteur de lecture avec un hôte console
//!
//! Cet exemple démontre :
//! - La restauration des préférences d'un utilisateur
//! - L'alternance entre élément natif et lecteur embarqué
//! - Les transitions sérialisées (next/previous) et le rejet des doublons
//! - La sauvegarde différée des préférences
//!
//! Pour exécuter :
//! ```bash
//! RUST_LOG=pmoplayer=debug cargo run -p pmoplayer --example playback_demo
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pmoplayer::{
    MediaElement, MediaEvent, MediaEventSender, MediaHandle, MediaHost, MemoryPreferenceStore,
    OwnerId, PlaybackCoordinator, PlaybackError, PlaybackSettings, PlaylistEntry,
    SurfaceCommand, SurfaceEndpoint, Topic,
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct ConsoleElement {
    id: String,
    source: String,
    playing: AtomicBool,
}

#[async_trait]
impl MediaElement for ConsoleElement {
    fn element_id(&self) -> String {
        self.id.clone()
    }

    async fn play(&self) -> Result<(), PlaybackError> {
        println!("   🔊 {} joue {}", self.id, self.source);
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        if self.playing.swap(false, Ordering::SeqCst) {
            println!("   ⏸  {} en pause", self.id);
        }
    }

    fn reset(&self) {}

    fn seek(&self, seconds: f64) {
        println!("   ⏩ {} -> {seconds:.1}s", self.id);
    }

    fn set_volume(&self, volume: f64) {
        println!("   🔉 {} volume {volume:.2}", self.id);
    }

    fn is_audible(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn release(&self) {
        println!("   🗑  {} libéré", self.id);
    }
}

#[derive(Default)]
struct ConsoleHost {
    counter: AtomicU64,
}

impl MediaHost for ConsoleHost {
    fn create_element(
        &self,
        source: &str,
        _events: MediaEventSender,
    ) -> Result<Arc<dyn MediaElement>, PlaybackError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ConsoleElement {
            id: format!("audio-{n}"),
            source: source.to_string(),
            playing: AtomicBool::new(false),
        }))
    }

    fn embed_surface(&self, endpoint: SurfaceEndpoint) -> Result<(), PlaybackError> {
        let (handle, source, mut commands, events) = endpoint.into_parts();
        println!("   🖼  lecteur embarqué {handle} pour {source}");
        tokio::spawn(async move {
            // le lecteur tiers met un moment à se charger
            sleep(Duration::from_millis(200)).await;
            events.send(MediaEvent::Ready);
            while let Some(command) = commands.recv().await {
                println!("   📨 {handle} <- {command:?}");
                if command == SurfaceCommand::Play {
                    events.send(MediaEvent::Progress {
                        current_time: 0.0,
                        duration: Some(212.0),
                    });
                }
            }
        });
        Ok(())
    }

    fn remove_surface(&self, handle: MediaHandle) {
        println!("   🗑  lecteur embarqué {handle} retiré");
    }
}

#[tokio::main]
async fn main() -> Result<(), PlaybackError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pmoplayer=info")),
        )
        .init();

    println!("=== Moteur de lecture ===\n");

    let preferences = Arc::new(MemoryPreferenceStore::new());
    let settings = PlaybackSettings {
        grace: Duration::from_millis(400),
        ..PlaybackSettings::default()
    };
    let player = PlaybackCoordinator::new(settings, Arc::new(ConsoleHost::default()), preferences.clone());

    player.subscribe(Topic::TrackChanged, |event| println!("📣 {event:?}"));
    player.subscribe(Topic::Notice, |event| println!("⚠️  {event:?}"));

    let alice = OwnerId::new("alice");
    player.start_session(Some(alice.clone())).await?;

    println!("\n📝 Playlist de trois morceaux");
    player.set_playlist(
        vec![
            PlaylistEntry::new("https://cdn.example.org/music/intro.mp3", "Intro"),
            PlaylistEntry::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "Clip"),
            PlaylistEntry::new("https://cdn.example.org/music/outro.mp3", "Outro"),
        ],
        None,
    )?;
    println!("▶️  play -> {:?}", player.play().await?);

    println!("\n⏭  Double next rapide");
    let (first, second) = tokio::join!(player.next(), player.next());
    println!("   premier: {:?}, second: {:?}", first?, second?);
    sleep(Duration::from_millis(500)).await;

    println!("\n🔉 Volume");
    player.set_volume(0.42);

    println!("\n⏮  previous");
    println!("   {:?}", player.previous().await?);
    sleep(Duration::from_millis(500)).await;

    player.shutdown().await;
    println!("\n💾 Préférences sauvegardées: {:?}", preferences.document(&alice));

    println!("\n🔁 Nouvelle session pour alice");
    let restored = PlaybackCoordinator::new(
        PlaybackSettings::default(),
        Arc::new(ConsoleHost::default()),
        preferences,
    );
    restored.start_session(Some(alice)).await?;
    let session = restored.snapshot();
    println!(
        "   morceau {} ({:?}), volume {:.2}",
        restored.active_index(),
        session.track_title,
        session.volume
    );
    restored.shutdown().await;

    Ok(())
}
