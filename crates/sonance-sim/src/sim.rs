//! Frame loop driving a headless engine through a scenario.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use glam::Vec3;
use serde::Serialize;
use sonance_common::{AssetKey, OwnerId};
use sonance_core::{
    AudioEngine, AudioSource, DecodedSound, EngineStats, HeadlessEngine, ManualClock,
    MemoryAssetStore,
};
use tracing::{debug, info};

use crate::scenario::{AssetLocation, SimConfig, SoundSpec};

/// Sample rate used for simulated assets.
const SIM_SAMPLE_RATE: u32 = 1000;

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Frames run.
    pub frames: u32,
    /// Simulated seconds.
    pub elapsed_secs: f32,
    /// Sources started.
    pub started: usize,
    /// Most channels playing at once.
    pub peak_playing: usize,
    /// Most sources alive at once.
    pub peak_sources: usize,
    /// Fetches issued.
    pub fetches: usize,
    /// Engine state after the last frame.
    pub final_stats: EngineStats,
}

/// Scenario runner.
pub struct Simulation {
    config: SimConfig,
    engine: HeadlessEngine,
    clock: ManualClock,
    store: MemoryAssetStore,
    assets: HashMap<String, AssetKey>,
    rng: fastrand::Rng,
}

impl Simulation {
    /// Build the engine and populate the asset store.
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;

        let clock = ManualClock::new();
        let store = MemoryAssetStore::new();
        let mut engine = AudioEngine::headless(&store, Arc::new(clock.clone()), config.audio.clone())
            .context("failed to create engine")?;
        engine.init(config.channels).context("failed to initialize engine")?;
        engine.set_listener_position(Vec3::from_array(config.listener));

        let mut assets = HashMap::new();
        for spec in &config.assets {
            let key = AssetKey::new();
            let sound = DecodedSound::silence(
                Duration::from_secs_f32(spec.duration_secs.max(0.0)),
                SIM_SAMPLE_RATE,
                1,
            );
            match spec.location {
                AssetLocation::Remote => store.insert_remote(key, sound),
                AssetLocation::Local => store.insert_local(key, sound),
                AssetLocation::Decoded => store.insert_decoded(key, sound),
                AssetLocation::Corrupt => store.insert_corrupt_local(key),
                AssetLocation::Missing => {},
            }
            debug!("Asset '{}' is {key} ({:?})", spec.name, spec.location);
            assets.insert(spec.name.clone(), key);
        }

        let rng = config.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);

        Ok(Self {
            config,
            engine,
            clock,
            store,
            assets,
            rng,
        })
    }

    /// Run every frame and report.
    pub fn run(mut self) -> SimReport {
        let frame = Duration::from_secs_f32(self.config.frame_secs);
        let mut started = 0;
        let mut peak_playing = 0;
        let mut peak_sources = 0;

        info!(
            "Running {} frames on {} channels ({})",
            self.config.frames,
            self.config.channels,
            self.engine.driver_name(true)
        );

        for n in 0..self.config.frames {
            let due: Vec<SoundSpec> = self
                .config
                .sounds
                .iter()
                .filter(|sound| sound.frame == n)
                .cloned()
                .collect();
            for sound in &due {
                started += self.start(sound);
            }

            self.engine.idle(self.config.decode_budget_secs);
            self.clock.advance(frame);

            let stats = self.engine.stats();
            peak_playing = peak_playing.max(stats.channels_playing);
            peak_sources = peak_sources.max(stats.sources);
        }

        let report = SimReport {
            frames: self.config.frames,
            elapsed_secs: self.config.frames as f32 * self.config.frame_secs,
            started,
            peak_playing,
            peak_sources,
            fetches: self.store.fetch_requests().len(),
            final_stats: self.engine.stats(),
        };
        self.engine.shutdown();
        report
    }

    fn start(&mut self, spec: &SoundSpec) -> usize {
        let Some(&key) = self.assets.get(&spec.asset) else {
            return 0;
        };

        let mut started = 0;
        for _ in 0..spec.count {
            let position = spec.position.map(|p| {
                let offset = Vec3::new(self.jitter(spec.scatter), self.jitter(spec.scatter), 0.0);
                Vec3::from_array(p) + offset
            });

            let mut source = AudioSource::new(OwnerId::random(), spec.gain, spec.sound_type)
                .with_looping(spec.looping)
                .with_sync_master(spec.sync_master)
                .with_sync_slave(spec.sync_slave);
            match position {
                Some(position) => source.set_position(position),
                None => source.set_ambient(true),
            }

            let id = self.engine.add_source(source);
            if let Some(outcome) = self.engine.play(id, key) {
                debug!("Started '{}' as {id}: {outcome:?}", spec.asset);
                started += 1;
            }
        }
        started
    }

    fn jitter(&mut self, radius: f32) -> f32 {
        if radius <= 0.0 {
            return 0.0;
        }
        (self.rng.f32() * 2.0 - 1.0) * radius
    }
}
