mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{FakeElement, FakeHost, clip, coordinator, coordinator_with, pass, tracks};
use pmoplayer::{
    BackendKind, LockState, MediaEvent, MemoryPreferenceStore, PlaybackError, PlaybackEvent,
    PlaybackNotice, PlaybackSettings, PlayOutcome, SurfaceCommand, TransitionOutcome, Visibility,
};
use tokio_test::{assert_err, assert_ok};

const GRACE_MS: u64 = 1600;

#[tokio::test(start_paused = true)]
async fn next_from_last_entry_wraps_and_arms_autoplay() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    let mut entries = vec![clip("a")];
    entries.extend(tracks(2));
    assert_ok!(player.set_playlist_at(entries.clone(), None, Some(2)));

    let outcome = player.next().await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Switched { index: 0 });

    let session = player.snapshot();
    assert_eq!(player.active_index(), 0);
    assert_eq!(session.source_url.as_deref(), Some(entries[0].url()));
    assert_eq!(session.backend_kind, BackendKind::External);
    assert!(session.autoplay_pending);
    assert_eq!(player.lock_state(), LockState::Transitioning);

    // the surface reports ready: pending autoplay is consumed
    assert!(host.surface_emit(MediaEvent::Ready));
    pass(10).await;
    let session = player.snapshot();
    assert!(!session.autoplay_pending);
    assert!(session.is_playing);
    assert!(host.surface_commands().contains(&SurfaceCommand::Play));

    pass(GRACE_MS).await;
    assert_eq!(player.lock_state(), LockState::Idle);
}

#[tokio::test(start_paused = true)]
async fn second_next_during_transition_is_rejected() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(3), None));

    let (first, second) = tokio::join!(player.next(), player.next());
    assert_eq!(first.unwrap(), TransitionOutcome::Switched { index: 1 });
    assert_eq!(second.unwrap(), TransitionOutcome::Rejected);
    assert_eq!(player.active_index(), 1);

    // still inside the grace window
    assert_eq!(player.next().await.unwrap(), TransitionOutcome::Rejected);
    assert_eq!(player.active_index(), 1);

    pass(GRACE_MS).await;
    assert_eq!(
        player.next().await.unwrap(),
        TransitionOutcome::Switched { index: 2 }
    );
}

#[tokio::test(start_paused = true)]
async fn active_index_wraps_modulo_len() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    let n = 4;
    assert_ok!(player.set_playlist(tracks(n), None));

    let mut expected = 0;
    for forward in [true, true, false, false, false, true, true, true, true, true, false] {
        let outcome = if forward {
            player.next().await
        } else {
            player.previous().await
        };
        expected = if forward {
            (expected + 1) % n
        } else {
            (expected + n - 1) % n
        };
        assert_eq!(outcome.unwrap(), TransitionOutcome::Switched { index: expected });
        assert!(player.active_index() < n);
        pass(GRACE_MS).await;
    }
    assert_eq!(player.active_index(), expected);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_resource_audible_after_switch() {
    let host = FakeHost::new();
    let preview = FakeElement::ambient("inline-preview", true);
    host.add_ambient(preview.clone(), Visibility::Foreground);
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(3), None));

    assert_eq!(
        player.play().await.unwrap(),
        PlayOutcome::Started(BackendKind::Native)
    );
    assert_eq!(player.audible_resources(), 2);

    assert_eq!(
        player.next().await.unwrap(),
        TransitionOutcome::Switched { index: 1 }
    );
    assert_eq!(player.audible_resources(), 1);
    assert!(!preview.is_playing());

    let elements = host.elements();
    assert_eq!(elements.len(), 2);
    assert!(elements[0].is_released());
    assert!(elements[1].is_playing());
    assert_eq!(elements[1].source(), tracks(3)[1].url());
}

#[tokio::test(start_paused = true)]
async fn ambient_sweep_skips_background_contexts() {
    let host = FakeHost::new();
    let other_tab = FakeElement::ambient("other-tab", true);
    let inline = FakeElement::ambient("inline", true);
    host.add_ambient(other_tab.clone(), Visibility::Background);
    host.add_ambient(inline.clone(), Visibility::Foreground);
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(2), None));

    assert_ok!(player.next().await);
    assert!(other_tab.is_playing());
    assert!(!inline.is_playing());
}

#[tokio::test(start_paused = true)]
async fn background_surfaces_are_paused_then_destroyed_in_foreground() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(vec![clip("a"), clip("b"), clip("c")], None));

    let (outcome, _) = tokio::join!(player.play(), async {
        pass(10).await;
        host.surface_emit(MediaEvent::Ready);
    });
    assert_eq!(outcome.unwrap(), PlayOutcome::Started(BackendKind::External));
    let first = host.live_surfaces()[0].0;

    player.set_visibility(Visibility::Background);
    assert_ok!(player.next().await);
    assert!(host.removed_surfaces().is_empty());
    assert_eq!(host.live_surfaces().len(), 2);
    assert_eq!(player.tracked_resources(), 2);

    pass(GRACE_MS).await;
    player.set_visibility(Visibility::Foreground);
    assert_ok!(player.next().await);
    let removed = host.removed_surfaces();
    assert_eq!(removed.len(), 2);
    assert!(removed.contains(&first));
    assert_eq!(player.tracked_resources(), 1);
}

#[tokio::test(start_paused = true)]
async fn ended_track_advances_to_next() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(2), None));
    assert_ok!(player.play().await);

    let first = host.last_element().unwrap();
    assert!(first.emit(MediaEvent::Ended));
    pass(200).await;

    assert_eq!(player.active_index(), 1);
    assert!(first.is_released());
    let second = host.last_element().unwrap();
    assert!(second.is_playing());
    assert!(player.snapshot().is_playing);
}

#[tokio::test(start_paused = true)]
async fn events_from_retired_resources_are_ignored() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(3), None));
    assert_ok!(player.play().await);
    let old = host.last_element().unwrap();

    assert_ok!(player.next().await);
    pass(GRACE_MS).await;

    old.emit(MediaEvent::Progress {
        current_time: 42.0,
        duration: Some(100.0),
    });
    old.emit(MediaEvent::Ended);
    pass(300).await;

    assert_eq!(player.active_index(), 1);
    assert_eq!(player.snapshot().current_time, 0.0);
}

#[tokio::test(start_paused = true)]
async fn empty_playlist_resets_without_engaging_lock() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist_at(tracks(3), None, Some(2)));
    assert_ok!(player.play().await);

    assert_ok!(player.set_playlist(Vec::new(), None));
    let session = player.snapshot();
    assert_eq!(player.active_index(), 0);
    assert_eq!(session.source_url, None);
    assert!(!session.is_playing);
    assert_eq!(player.lock_state(), LockState::Idle);
    assert_eq!(player.tracked_resources(), 0);
    assert!(host.last_element().unwrap().is_released());

    assert_eq!(player.next().await.unwrap(), TransitionOutcome::Empty);
    assert_eq!(player.lock_state(), LockState::Idle);
}

#[tokio::test(start_paused = true)]
async fn source_edits_rejected_while_transitioning() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(3), None));
    assert_ok!(player.next().await);

    assert!(matches!(
        player.set_playlist(tracks(1), None),
        Err(PlaybackError::TransitionInProgress)
    ));
    assert!(matches!(
        player.remove(1),
        Err(PlaybackError::TransitionInProgress)
    ));
    // not a source change
    assert_ok!(player.remove(2));
    assert_eq!(player.set_volume(0.5), 0.5);

    pass(GRACE_MS).await;
    assert_ok!(player.set_playlist(tracks(1), None));
}

#[tokio::test(start_paused = true)]
async fn jump_to_out_of_range_releases_lock() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(3), None));

    assert!(matches!(
        player.jump_to(3).await,
        Err(PlaybackError::InvalidIndex { index: 3, len: 3 })
    ));
    assert_eq!(player.lock_state(), LockState::Idle);

    assert_eq!(
        player.jump_to(2).await.unwrap(),
        TransitionOutcome::Switched { index: 2 }
    );
    assert_err!(player.set_playlist(tracks(2), None));
}

#[tokio::test(start_paused = true)]
async fn play_while_settling_waits_for_the_new_source() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(3), None));
    assert_ok!(player.play().await);

    let (outcome, played) = tokio::join!(player.next(), async {
        pass(10).await;
        player.play().await
    });
    assert_eq!(outcome.unwrap(), TransitionOutcome::Switched { index: 1 });
    assert_eq!(played.unwrap(), PlayOutcome::Unavailable);

    assert_eq!(player.audible_resources(), 1);
    assert_eq!(player.tracked_resources(), 1);
    let elements = host.elements();
    assert_eq!(elements.len(), 2);
    assert!(elements[0].is_released());
    assert_eq!(elements[1].source(), tracks(3)[1].url());
    assert!(elements[1].is_playing());
    assert!(player.snapshot().is_playing);
}

#[tokio::test(start_paused = true)]
async fn removing_an_earlier_entry_while_settling_keeps_the_target() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist_at(tracks(3), None, Some(1)));

    let (outcome, removed) = tokio::join!(player.next(), async {
        pass(10).await;
        player.remove(0)
    });
    assert_eq!(removed.unwrap().title(), "Track 0");
    assert_eq!(outcome.unwrap(), TransitionOutcome::Switched { index: 1 });

    assert_eq!(player.active_index(), 1);
    assert_eq!(player.snapshot().track_title.as_deref(), Some("Track 2"));
    assert_eq!(player.tracked_resources(), 1);
    let current = host.last_element().unwrap();
    assert_eq!(current.source(), tracks(3)[2].url());
    assert!(current.is_playing());
}

#[tokio::test(start_paused = true)]
async fn timed_out_transition_reports_and_frees_lock() {
    let host = FakeHost::new();
    let settings = PlaybackSettings {
        settle_delay: Duration::from_millis(200),
        transition_timeout: Duration::from_millis(100),
        ..PlaybackSettings::default()
    };
    let player = coordinator_with(&host, settings, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(3), None));
    assert_ok!(player.play().await);
    let events = player.events();

    let outcome = player.next().await.unwrap();
    assert!(matches!(outcome, TransitionOutcome::Failed(_)));
    assert!(events.try_iter().any(|e| matches!(
        e,
        PlaybackEvent::Notice(PlaybackNotice::TransitionFailed { .. })
    )));
    assert_eq!(player.lock_state(), LockState::Idle);
    assert_eq!(player.active_index(), 0);
    assert_eq!(player.audible_resources(), 0);

    // the lock is free again: the next attempt runs instead of being rejected
    assert!(matches!(
        player.next().await.unwrap(),
        TransitionOutcome::Failed(_)
    ));
    assert_ok!(player.set_playlist(tracks(1), None));
}

#[tokio::test(start_paused = true)]
async fn failed_load_after_switch_reports_backend_error() {
    let host = FakeHost::new();
    let player = coordinator(&host, Arc::new(MemoryPreferenceStore::new()));
    assert_ok!(player.set_playlist(tracks(2), None));
    assert_ok!(player.play().await);
    let events = player.events();

    host.fail_element_creation(true);
    assert_eq!(
        player.next().await.unwrap(),
        TransitionOutcome::Switched { index: 1 }
    );
    assert!(events.try_iter().any(|e| matches!(
        e,
        PlaybackEvent::Notice(PlaybackNotice::BackendError {
            backend: BackendKind::Native,
            ..
        })
    )));
    assert_eq!(player.tracked_resources(), 0);
    assert_eq!(player.audible_resources(), 0);

    pass(GRACE_MS).await;
    assert_eq!(player.lock_state(), LockState::Idle);
    assert_err!(player.play().await);

    host.fail_element_creation(false);
    assert_eq!(
        player.play().await.unwrap(),
        PlayOutcome::Started(BackendKind::Native)
    );
    assert_eq!(host.last_element().unwrap().source(), tracks(2)[1].url());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_clear_never_breaks_a_transition() {
    let host = FakeHost::new();
    let settings = PlaybackSettings {
        settle_delay: Duration::from_millis(2),
        grace: Duration::from_millis(2),
        ..PlaybackSettings::default()
    };
    let player = coordinator_with(&host, settings, Arc::new(MemoryPreferenceStore::new()));

    for round in 0..40 {
        assert_ok!(player.set_playlist(tracks(3), None));
        let editor = player.clone();
        let cleared = tokio::spawn(async move { editor.clear_playlist() });
        let outcome = player.next().await.unwrap();
        let cleared = cleared.await.unwrap();

        assert!(
            !matches!(outcome, TransitionOutcome::Failed(_)),
            "round {round}: {outcome:?}"
        );
        assert!(matches!(
            cleared,
            Ok(()) | Err(PlaybackError::TransitionInProgress)
        ));
        if player.playlist().is_empty() {
            assert_eq!(player.snapshot().source_url, None);
        }
        while player.lock_state() != LockState::Idle {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
