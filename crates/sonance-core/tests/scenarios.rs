//! End-to-end engine scenarios on the headless backend.

use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use sonance_core::prelude::*;

struct Harness {
    engine: HeadlessEngine,
    clock: ManualClock,
    store: MemoryAssetStore,
}

impl Harness {
    fn new(channels: usize) -> Self {
        let clock = ManualClock::new();
        let store = MemoryAssetStore::new();
        let mut engine = AudioEngine::headless(&store, Arc::new(clock.clone()), AudioConfig::default())
            .expect("engine");
        engine.init(channels).expect("init");
        Self {
            engine,
            clock,
            store,
        }
    }

    fn decoded(&self, secs: f32) -> AssetKey {
        let key = AssetKey::new();
        self.store.insert_decoded(key, sound(secs));
        key
    }

    fn frame(&mut self, secs: f32) {
        self.clock.advance_secs(secs);
        self.engine.idle(0.01);
    }

    fn channel_of(&self, id: SourceId) -> Option<&ChannelSlot<HeadlessChannel>> {
        let idx = self.engine.find_source(id)?.channel()?;
        self.engine.channel(idx)
    }
}

fn sound(secs: f32) -> DecodedSound {
    DecodedSound::silence(Duration::from_secs_f32(secs), 1000, 1)
}

#[test]
fn test_single_trigger_plays_on_first_frame() {
    let mut h = Harness::new(4);
    let key = h.decoded(2.0);

    let id = h
        .engine
        .trigger_sound(key, OwnerId::random(), 1.0, SoundType::None, None)
        .expect("source");
    h.engine.idle(0.01);

    assert_eq!(h.engine.source_count(), 1);
    let channel = h.channel_of(id).expect("bound");
    assert_eq!(channel.source(), Some(id));
    assert!(channel.buffer().is_some());
    assert!(channel.is_playing());
}

#[test]
fn test_single_trigger_local_asset_plays_after_decode() {
    let mut h = Harness::new(4);
    let key = AssetKey::new();
    h.store.insert_local(key, sound(2.0));

    let id = h
        .engine
        .trigger_sound(key, OwnerId::random(), 1.0, SoundType::None, None)
        .expect("source");

    h.engine.idle(0.01);
    assert!(h.store.is_decoded(key));
    h.engine.idle(0.01);

    assert!(h.channel_of(id).is_some_and(ChannelSlot::is_playing));
    assert!(h.store.fetch_requests().is_empty());
}

#[test]
fn test_starved_channel_goes_to_higher_priority() {
    let mut h = Harness::new(1);
    let key = h.decoded(5.0);

    let far = h
        .engine
        .trigger_sound(key, OwnerId::random(), 1.0, SoundType::Sfx, Some(Vec3::new(10.0, 0.0, 0.0)))
        .expect("far");
    let near = h
        .engine
        .trigger_sound(key, OwnerId::random(), 1.0, SoundType::Sfx, Some(Vec3::new(1.0, 0.0, 0.0)))
        .expect("near");
    h.engine.idle(0.01);

    assert_eq!(h.engine.channel(0).and_then(ChannelSlot::source), Some(near));
    let near_source = h.engine.find_source(near).expect("near");
    assert!((near_source.priority() - 1.0).abs() < f32::EPSILON);
    assert!(h
        .engine
        .find_source(far)
        .map_or(true, |source| source.channel().is_none()));
}

#[test]
fn test_queue_holds_one_and_advances_when_stopped() {
    let mut h = Harness::new(2);
    let p = h.decoded(3.0);
    let q = h.decoded(3.0);
    let q2 = h.decoded(3.0);

    let id = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Sfx)
            .ambient()
            .with_queue_sounds(true),
    );
    assert_eq!(h.engine.play(id, p), Some(PlayOutcome::Playing));

    assert_eq!(h.engine.play(id, q), Some(PlayOutcome::Queued));
    assert_eq!(h.engine.play(id, q2), Some(PlayOutcome::Dropped));
    let source = h.engine.find_source(id).expect("source");
    assert_eq!(source.current_asset(), Some(p));
    assert_eq!(source.queued_asset(), Some(q));

    let idx = source.channel().expect("channel");
    h.engine.channel_backend_mut(idx).expect("channel").force_stop();
    h.frame(0.016);

    let source = h.engine.find_source(id).expect("source");
    assert_eq!(source.current_asset(), Some(q));
    assert!(source.queued_asset().is_none());

    let channel = h.engine.channel(idx).expect("slot");
    assert!(channel.is_playing());
    assert_eq!(channel.backend().attached_asset(), Some(q));
}

#[test]
fn test_queued_sound_follows_finished_one_shot() {
    let mut h = Harness::new(1);
    let first = h.decoded(1.0);
    let second = h.decoded(1.0);

    let id = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Sfx)
            .ambient()
            .with_queue_sounds(true),
    );
    h.engine.play(id, first);
    h.engine.play(id, second);

    h.frame(0.5);
    assert_eq!(h.engine.find_source(id).and_then(AudioSource::current_asset), Some(first));

    h.frame(0.6);
    assert_eq!(h.engine.find_source(id).and_then(AudioSource::current_asset), Some(second));
    assert_eq!(h.engine.source_state(id), Some(SourceState::Playing));
}

#[test]
fn test_looping_source_never_reaped() {
    let mut h = Harness::new(2);
    let key = h.decoded(1.0);
    let id = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Ambient)
            .ambient()
            .with_looping(true),
    );
    h.engine.play(id, key);

    for _ in 0..130 {
        h.frame(0.5);
    }

    assert!(!h.engine.is_source_done(id));
    assert_eq!(h.engine.source_state(id), Some(SourceState::Playing));
    assert!(h.engine.find_source(id).is_some_and(|s| s.age(Duration::from_secs(65)) > Duration::from_secs(60)));
}

#[test]
fn test_failed_fetch_is_never_retried() {
    let mut h = Harness::new(2);
    let missing = AssetKey::new();

    let current = h
        .engine
        .trigger_sound(missing, OwnerId::random(), 1.0, SoundType::Sfx, None)
        .expect("source");
    let preloader = h.engine.add_source(AudioSource::new(OwnerId::random(), 0.5, SoundType::Sfx));
    h.engine.preload_source_asset(preloader, missing);

    for _ in 0..20 {
        h.frame(0.1);
    }

    let asset = h.engine.asset(missing).expect("asset");
    assert!(!asset.has_valid_data());
    assert_eq!(h.store.fetch_requests(), vec![missing]);
    assert!(h.engine.current_transfer().is_none());

    // Re-requesting the poisoned asset does not fetch it either.
    h.engine.play(current, missing);
    h.frame(0.1);
    assert_eq!(h.store.fetch_requests(), vec![missing]);
}

#[test]
fn test_explicit_fetch_failure_poisons() {
    let mut h = Harness::new(2);
    let z = AssetKey::new();
    let id = h.engine.add_source(AudioSource::new(OwnerId::random(), 1.0, SoundType::Sfx));
    h.engine.play(id, z);
    assert_eq!(h.engine.current_transfer(), Some(z));

    h.engine.fetch_completed(z, false);
    assert!(h.engine.current_transfer().is_none());

    for _ in 0..5 {
        h.frame(0.1);
    }
    assert!(h.engine.current_transfer().is_none());
}

#[test]
fn test_fetches_run_one_at_a_time_in_priority_order() {
    let mut h = Harness::new(4);
    let quiet = AssetKey::new();
    let loud = AssetKey::new();
    h.store.insert_remote(quiet, sound(1.0));
    h.store.insert_remote(loud, sound(1.0));

    h.engine.set_muted(true);
    let a = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Sfx).with_position(Vec3::new(20.0, 0.0, 0.0)),
    );
    let b = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Sfx).with_position(Vec3::new(2.0, 0.0, 0.0)),
    );
    h.engine.play(a, quiet);
    h.engine.play(b, loud);
    assert!(h.store.fetch_requests().is_empty());

    h.engine.set_muted(false);
    h.frame(0.016);
    assert_eq!(h.store.fetch_requests(), vec![loud]);

    h.frame(0.016);
    assert_eq!(h.store.fetch_requests(), vec![loud, quiet]);
}

#[test]
fn test_sync_slave_starts_on_master_loop() {
    let mut h = Harness::new(2);
    let beat = h.decoded(1.0);
    let melody = h.decoded(1.0);

    let master = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Ambient)
            .ambient()
            .with_looping(true)
            .with_sync_master(true),
    );
    let slave = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Ambient)
            .ambient()
            .with_looping(true)
            .with_sync_slave(true),
    );
    assert_eq!(h.engine.play(master, beat), Some(PlayOutcome::Playing));
    assert_eq!(h.engine.play(slave, melody), Some(PlayOutcome::Waiting));

    h.frame(0.5);
    let channel = h.channel_of(slave).expect("slave channel");
    assert!(channel.is_waiting());
    assert!(!channel.is_playing());

    h.frame(0.6);
    let channel = h.channel_of(slave).expect("slave channel");
    assert!(channel.is_playing());
    assert!(!channel.is_waiting());
    assert!(h.engine.find_source(slave).is_some_and(AudioSource::played_once));
    assert_ne!(
        h.engine.find_source(master).and_then(AudioSource::channel),
        h.engine.find_source(slave).and_then(AudioSource::channel)
    );
}

#[test]
fn test_listener_movement_reorders_priorities() {
    let mut h = Harness::new(1);
    let key = h.decoded(10.0);
    let west = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Sfx).with_position(Vec3::new(-10.0, 0.0, 0.0)),
    );
    let east = h.engine.add_source(
        AudioSource::new(OwnerId::random(), 1.0, SoundType::Sfx).with_position(Vec3::new(10.0, 0.0, 0.0)),
    );
    h.engine.set_listener_position(Vec3::new(-9.0, 0.0, 0.0));
    h.engine.play(west, key);
    h.engine.play(east, key);
    h.frame(0.016);
    assert_eq!(h.engine.channel(0).and_then(ChannelSlot::source), Some(west));

    // Standing next to the east source hands it the channel.
    h.engine.translate_listener(Vec3::new(18.0, 0.0, 0.0));
    h.frame(0.016);
    assert_eq!(h.engine.play(east, key), Some(PlayOutcome::Playing));
    assert_eq!(h.engine.channel(0).and_then(ChannelSlot::source), Some(east));
}

#[test]
fn test_stats_track_pools() {
    let mut h = Harness::new(3);
    let key = h.decoded(1.0);
    h.engine.trigger_sound(key, OwnerId::random(), 1.0, SoundType::Sfx, None);
    h.engine.trigger_sound(key, OwnerId::random(), 1.0, SoundType::Sfx, None);
    h.frame(0.1);

    let stats = h.engine.stats();
    assert_eq!(stats.sources, 2);
    assert_eq!(stats.assets, 1);
    assert_eq!(stats.decoded_assets, 1);
    assert_eq!(stats.channels_bound, 2);
    assert_eq!(stats.channels_playing, 2);
    assert_eq!(stats.buffers_allocated, 1);
    assert_eq!(stats.buffers_in_use, 1);
    assert_eq!(stats.channels_stalled(), 0);
}
