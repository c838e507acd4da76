//! The scheduling engine.
//!
//! [`AudioEngine`] owns a fixed pool of backend channels, a fixed pool of
//! decoded-PCM buffers, and unbounded tables of sources and assets. Once per
//! frame, [`AudioEngine::idle`] reranks every source, hands the best
//! channel-less one a free or preemptable channel, keeps channel buffers in
//! step with what their sources want to play, advances queued sounds,
//! aligns sync slaves to their master's loop, sweeps stale buffers and
//! pumps the decoder and fetcher.
//!
//! All cross links (channel to source, source to channel, asset to buffer,
//! buffer to asset) are plain ids or pool indices. Every path that breaks
//! one side of a link clears the other side before returning.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use glam::Vec3;
use sonance_common::{AssetKey, AudioError, AudioResult, OwnerId, SourceId};
use tracing::{debug, error, info, trace, warn};

use crate::asset::AudioAsset;
use crate::backend::{AudioBackend, BackendBuffer, BackendChannel, Emitter};
use crate::buffer::BufferSlot;
use crate::channel::ChannelSlot;
use crate::clock::Clock;
use crate::config::AudioConfig;
use crate::decode::{DecodeEvent, Decoder};
use crate::fetch::AssetFetcher;
use crate::listener::Listener;
use crate::source::{AudioSource, SoundType, SourceState};
use crate::stats::EngineStats;

/// Result of a play request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayOutcome {
    /// Null key: the channel was released and the current asset cleared.
    Stopped,
    /// Placed behind the current sound.
    Queued,
    /// The queue slot was taken; the request was dropped.
    Dropped,
    /// No buffer yet. Playback starts once the data is decoded.
    Pending,
    /// Buffer ready but no channel could be had this frame.
    NoChannel,
    /// Bound as a sync slave, held until the master loops.
    Waiting,
    /// Playing.
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferReadiness {
    Ready,
    Pending,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Current,
    Queued,
    Dropped,
    Preload,
    Unchanged,
}

/// Buffer pool index holding `key`'s data.
fn asset_buffer(assets: &AHashMap<AssetKey, AudioAsset>, key: Option<AssetKey>) -> Option<usize> {
    key.and_then(|key| assets.get(&key)).and_then(AudioAsset::buffer)
}

/// First-wins strict-greater priority pick over `sources`.
fn pick_by_priority<'a, I, F>(sources: I, wanted: F) -> Option<AssetKey>
where
    I: IntoIterator<Item = &'a AudioSource>,
    F: Fn(&AudioSource) -> Option<AssetKey>,
{
    let mut best: Option<(AssetKey, f32)> = None;
    for source in sources {
        if best.is_some_and(|(_, priority)| source.priority() <= priority) {
            continue;
        }
        if let Some(key) = wanted(source) {
            best = Some((key, source.priority()));
        }
    }
    best.map(|(key, _)| key)
}

/// Sound-source prioritization and channel allocation engine.
pub struct AudioEngine<B: AudioBackend> {
    backend: B,
    decoder: Box<dyn Decoder>,
    fetcher: Box<dyn AssetFetcher>,
    clock: Arc<dyn Clock>,
    config: AudioConfig,
    initialized: bool,
    listener: Listener,
    muted: bool,
    master_gain: f32,
    secondary_gains: [f32; SoundType::COUNT],
    channels: Vec<Option<ChannelSlot<B::Channel>>>,
    buffers: Vec<Option<BufferSlot<B::Buffer>>>,
    sources: BTreeMap<SourceId, AudioSource>,
    assets: AHashMap<AssetKey, AudioAsset>,
    current_transfer: Option<AssetKey>,
}

impl<B: AudioBackend> fmt::Debug for AudioEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioEngine")
            .field("config", &self.config)
            .field("initialized", &self.initialized)
            .field("muted", &self.muted)
            .field("master_gain", &self.master_gain)
            .field("sources", &self.sources.len())
            .field("assets", &self.assets.len())
            .field("current_transfer", &self.current_transfer)
            .finish_non_exhaustive()
    }
}

impl<B: AudioBackend> AudioEngine<B> {
    /// Create an engine. Call [`init`](Self::init) before the first frame.
    pub fn new<D, F>(
        backend: B,
        decoder: D,
        fetcher: F,
        clock: Arc<dyn Clock>,
        config: AudioConfig,
    ) -> AudioResult<Self>
    where
        D: Decoder + 'static,
        F: AssetFetcher + 'static,
    {
        config.validate()?;

        let listener = Listener {
            doppler_factor: config.doppler_factor,
            distance_factor: config.distance_factor,
            rolloff_factor: config.rolloff_factor,
            ..Listener::default()
        };

        Ok(Self {
            backend,
            decoder: Box::new(decoder),
            fetcher: Box::new(fetcher),
            clock,
            master_gain: config.master_gain.clamp(0.0, 1.0),
            config,
            initialized: false,
            listener,
            muted: false,
            secondary_gains: [1.0; SoundType::COUNT],
            channels: Vec::new(),
            buffers: Vec::new(),
            sources: BTreeMap::new(),
            assets: AHashMap::new(),
            current_transfer: None,
        })
    }

    /// Size the channel pool and start accepting frames.
    pub fn init(&mut self, num_channels: usize) -> AudioResult<()> {
        if num_channels == 0 || num_channels > self.config.max_channels {
            return Err(AudioError::InvalidChannelCount {
                requested: num_channels,
                max: self.config.max_channels,
            });
        }
        if self.initialized {
            warn!("Audio engine already initialized, reinitializing");
            self.shutdown();
        }

        self.channels = (0..num_channels).map(|_| None).collect();
        self.buffers = (0..self.config.max_buffers).map(|_| None).collect();
        self.initialized = true;

        info!(
            "Audio engine initialized: {} channels, {} buffers, driver {}",
            num_channels,
            self.config.max_buffers,
            self.backend.driver_name(false)
        );
        Ok(())
    }

    /// Initialize with the configured channel count.
    pub fn init_from_config(&mut self) -> AudioResult<()> {
        self.init(self.config.max_channels)
    }

    /// Release every source, asset, channel and buffer.
    pub fn shutdown(&mut self) {
        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in ids {
            self.remove_source(id);
        }
        for slot in self.channels.iter_mut().flatten() {
            slot.release();
        }
        self.channels.clear();
        self.buffers.clear();
        self.assets.clear();
        self.current_transfer = None;

        if self.initialized {
            self.initialized = false;
            info!("Audio engine shut down");
        }
    }

    /// Check if initialized.
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Engine configuration.
    pub const fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Name of the mixing driver.
    pub fn driver_name(&self, verbose: bool) -> String {
        self.backend.driver_name(verbose)
    }

    // ------------------------------------------------------------------
    // Per-frame scheduling
    // ------------------------------------------------------------------

    /// Run one scheduling pass.
    ///
    /// `max_decode_time` is the decode budget in seconds; non-positive
    /// values use the configured default. Never fails: anything that cannot
    /// happen this frame is retried on the next one.
    pub fn idle(&mut self, max_decode_time: f32) {
        if !self.initialized {
            trace!("idle() before init, skipping");
            return;
        }
        let budget = Duration::try_from_secs_f32(max_decode_time)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| self.config.default_decode_budget());

        let gain = if self.muted { 0.0 } else { self.master_gain };
        self.backend.set_internal_gain(gain);

        // Mark; bound channels re-mark their buffers below.
        for slot in self.buffers.iter_mut().flatten() {
            slot.in_use = false;
        }

        if let Some((id, priority)) = self.update_sources() {
            self.assign_channel(id, priority);
        }

        self.update_channels();
        self.advance_queues();
        self.update_channels();
        self.sync_loops();
        self.commit_deferred_changes();
        self.reclaim_stale_buffers();

        for slot in self.channels.iter_mut().flatten() {
            slot.looped_this_frame = false;
        }

        self.pump_decoder(budget);
        self.pump_fetcher();
        self.backend.tick();
    }

    /// Update, rerank and reap every source. Returns the best channel-less
    /// source with a ready buffer.
    fn update_sources(&mut self) -> Option<(SourceId, f32)> {
        let listener = self.listener.position;
        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        let mut best: Option<(SourceId, f32)> = None;

        for id in ids {
            self.update_source(id);

            let now = self.clock.now();
            let Some(source) = self.sources.get_mut(&id) else {
                continue;
            };
            source.update_priority(listener);

            let Some(source) = self.sources.get(&id) else {
                continue;
            };
            if self.source_done(source, now) {
                debug!("Reaping source {id}");
                self.remove_source(id);
                continue;
            }

            let Some(source) = self.sources.get(&id) else {
                continue;
            };
            if source.channel.is_none()
                && asset_buffer(&self.assets, source.current).is_some()
                && best.map_or(true, |(_, priority)| source.priority() > priority)
            {
                best = Some((id, source.priority()));
            }
        }
        best
    }

    /// Load a source's current asset if it became decoded, then start it.
    fn update_source(&mut self, id: SourceId) {
        let Some(key) = self.sources.get(&id).and_then(AudioSource::current_asset) else {
            return;
        };
        let Some(asset) = self.assets.get(&key) else {
            return;
        };
        if asset.buffer().is_some() || !asset.has_valid_data() || !asset.has_decoded_data() {
            return;
        }
        if self.load_asset(key) {
            debug!("Asset {key} became available for source {id}");
            self.start_playback(id);
        }
    }

    fn assign_channel(&mut self, id: SourceId, priority: f32) {
        let Some(idx) = self.get_free_channel(priority) else {
            trace!("No channel for source {id} at priority {priority}");
            return;
        };
        self.bind_channel(idx, id);

        let slave = self.sources.get(&id).is_some_and(AudioSource::is_sync_slave);
        if let Some(slot) = self.channel_slot_mut(idx) {
            slot.waiting_for_sync = slave;
        }
        if !slave {
            self.channel_play(idx);
        }
    }

    fn update_channels(&mut self) {
        for idx in 0..self.channels.len() {
            self.update_channel_buffer(idx);
            self.update_channel_3d(idx);
            self.update_channel_loop(idx);
        }
    }

    /// Promote queued assets. Each source is visited at most once.
    fn advance_queues(&mut self) {
        let now = self.clock.now();
        let queued: Vec<SourceId> = self
            .sources
            .iter()
            .filter(|(_, source)| source.queued.is_some())
            .map(|(id, _)| *id)
            .collect();

        for id in queued {
            let Some(source) = self.sources.get(&id) else {
                continue;
            };
            let looping = source.is_loop();
            let channel = source.channel;
            let playing = channel.is_some_and(|idx| self.channel_is_playing(idx));

            match channel {
                None => {
                    let Some(key) = self.promote_queued(id, now, true) else {
                        continue;
                    };
                    self.ensure_buffer(key);
                    if let Some(idx) = self.setup_channel(id) {
                        self.update_channel_buffer(idx);
                        self.channel_play(idx);
                    }
                },
                Some(idx) if !playing => {
                    let Some(key) = self.promote_queued(id, now, true) else {
                        continue;
                    };
                    self.ensure_buffer(key);
                    self.update_channel_buffer(idx);
                    self.channel_play(idx);
                },
                Some(idx) if looping && self.looped_this_frame(idx) => {
                    let Some(key) = self.promote_queued(id, now, false) else {
                        continue;
                    };
                    self.ensure_buffer(key);
                    self.update_channel_buffer(idx);
                    self.channel_play(idx);
                },
                Some(_) => {},
            }
        }
    }

    fn promote_queued(&mut self, id: SourceId, now: Duration, reset_age: bool) -> Option<AssetKey> {
        let source = self.sources.get_mut(&id)?;
        if !source.promote_queued() {
            return None;
        }
        if reset_age {
            source.reset_age(now);
        }
        let key = source.current;
        debug!("Source {id} advanced to queued asset {key:?}");
        key
    }

    /// Start non-playing sync slaves in phase with the top sync master.
    fn sync_loops(&mut self) {
        let mut master: Option<(usize, f32)> = None;
        for source in self.sources.values() {
            if !source.is_sync_master() {
                continue;
            }
            let Some(idx) = source.channel else {
                continue;
            };
            if master.map_or(true, |(_, priority)| source.priority() > priority) {
                master = Some((idx, source.priority()));
            }
        }

        let Some((master_idx, _)) = master else {
            return;
        };
        let Some(master_slot) = self.channel_slot(master_idx) else {
            return;
        };
        if !master_slot.looped_this_frame {
            return;
        }
        let position = master_slot.channel.playback_position();

        let slaves: Vec<(SourceId, usize)> = self
            .sources
            .values()
            .filter(|source| source.is_sync_slave())
            .filter_map(|source| source.channel.map(|idx| (source.id(), idx)))
            .filter(|(_, idx)| *idx != master_idx)
            .collect();

        for (id, idx) in slaves {
            let Some(slot) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
                continue;
            };
            if slot.channel.is_playing() {
                continue;
            }
            if slot.buffer.is_some() {
                slot.channel.play_synced(position);
                if let Some(source) = self.sources.get_mut(&id) {
                    source.played_once = true;
                }
            }
            slot.waiting_for_sync = false;
            debug!("Synced channel {idx} to master channel {master_idx}");
        }
    }

    fn reclaim_stale_buffers(&mut self) {
        let now = self.clock.now();
        let threshold = self.config.buffer_stale();

        for idx in 0..self.buffers.len() {
            let Some(slot) = self.buffers[idx].as_ref() else {
                continue;
            };
            if !slot.is_stale(now, threshold) {
                continue;
            }
            if self.channels.iter().flatten().any(|c| c.buffer == Some(idx)) {
                continue;
            }
            if let Some(asset) = slot.asset.and_then(|key| self.assets.get_mut(&key)) {
                asset.set_buffer(None);
            }
            debug!("Releasing stale buffer {idx}");
            self.buffers[idx] = None;
        }
    }

    fn pump_decoder(&mut self, budget: Duration) {
        for event in self.decoder.process_queue(budget) {
            let key = event.key();
            let Some(asset) = self.assets.get_mut(&key) else {
                debug!("Decode event for untracked asset {key}");
                continue;
            };
            match event {
                DecodeEvent::Decoded(_) => {
                    trace!("Decoded asset {key}");
                    asset.mark_decoded();
                },
                DecodeEvent::Failed(_) => {
                    warn!("Failed to decode asset {key}, marking invalid");
                    asset.mark_decode_failed();
                },
            }
        }
    }

    fn pump_fetcher(&mut self) {
        for completion in self.fetcher.poll_completions() {
            self.fetch_completed(completion.key, completion.success);
        }
        self.start_next_transfer();
    }

    // ------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------

    /// Create a one-shot source, rank it and start playing `key`.
    ///
    /// `position` of `None` makes the source ambient. Returns `None` while
    /// muted.
    pub fn trigger_sound(
        &mut self,
        key: AssetKey,
        owner: OwnerId,
        gain: f32,
        sound_type: SoundType,
        position: Option<Vec3>,
    ) -> Option<SourceId> {
        if self.muted {
            debug!("Muted, ignoring trigger of {key}");
            return None;
        }

        let mut source = AudioSource::new(owner, gain, sound_type);
        match position {
            Some(position) => source.set_position(position),
            None => source.set_ambient(true),
        }
        let id = self.add_source(source);
        self.play(id, key);
        Some(id)
    }

    /// Register a caller-built source.
    pub fn add_source(&mut self, mut source: AudioSource) -> SourceId {
        let id = source.id();
        if self.sources.contains_key(&id) {
            warn!("Source {id} already registered, replacing");
            self.remove_source(id);
        }
        source.reset_age(self.clock.now());
        source.update_priority(self.listener.position);
        self.sources.insert(id, source);
        id
    }

    /// Destroy a source. Returns false for unknown ids.
    pub fn release_source(&mut self, id: SourceId) -> bool {
        if self.remove_source(id).is_none() {
            warn!("Release of unknown source {id}");
            return false;
        }
        true
    }

    fn remove_source(&mut self, id: SourceId) -> Option<AudioSource> {
        if let Some(idx) = self.sources.get(&id).and_then(AudioSource::channel) {
            self.release_channel(idx);
        }
        self.sources.remove(&id)
    }

    /// Look up a source.
    pub fn find_source(&self, id: SourceId) -> Option<&AudioSource> {
        self.sources.get(&id)
    }

    /// Look up a source for position, gain or flag updates.
    pub fn source_mut(&mut self, id: SourceId) -> Option<&mut AudioSource> {
        self.sources.get_mut(&id)
    }

    /// Registered sources in id order.
    pub fn sources(&self) -> impl Iterator<Item = &AudioSource> {
        self.sources.values()
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Ask a source to play `key`. A null key stops it and clears its
    /// current asset. Returns `None` for unknown sources.
    pub fn play(&mut self, id: SourceId, key: AssetKey) -> Option<PlayOutcome> {
        if !self.sources.contains_key(&id) {
            warn!("play() on unknown source {id}");
            return None;
        }

        if key.is_null() {
            if let Some(idx) = self.sources.get(&id).and_then(AudioSource::channel) {
                self.release_channel(idx);
            }
            if let Some(source) = self.sources.get_mut(&id) {
                source.current = None;
            }
            return Some(PlayOutcome::Stopped);
        }

        // Any request is proof of life, even one that cannot play yet.
        let now = self.clock.now();
        if let Some(source) = self.sources.get_mut(&id) {
            source.reset_age(now);
        }

        self.get_or_create_asset(key);
        let readiness = self.ensure_buffer(key);

        match self.add_audio_data(id, key, true) {
            Placement::Queued => Some(PlayOutcome::Queued),
            Placement::Dropped => Some(PlayOutcome::Dropped),
            _ => Some(self.start_channel(id, readiness)),
        }
    }

    /// Add `key` to a source's preload set and request its decode.
    ///
    /// Returns true when the data is already decoded or a decode was queued.
    pub fn preload_source_asset(&mut self, id: SourceId, key: AssetKey) -> bool {
        if key.is_null() || !self.sources.contains_key(&id) {
            return false;
        }
        let now = self.clock.now();
        if let Some(source) = self.sources.get_mut(&id) {
            source.reset_age(now);
        }

        self.get_or_create_asset(key);
        self.add_audio_data(id, key, false);

        let Some(asset) = self.assets.get(&key) else {
            return false;
        };
        if asset.has_decoded_data() {
            return true;
        }
        if asset.has_local_data() && asset.has_valid_data() {
            return self.decoder.request_decode(key);
        }
        false
    }

    /// Restart a source's current asset after its data became available.
    fn start_playback(&mut self, id: SourceId) -> PlayOutcome {
        let now = self.clock.now();
        let Some(source) = self.sources.get_mut(&id) else {
            return PlayOutcome::Pending;
        };
        source.reset_age(now);
        let Some(key) = source.current else {
            return PlayOutcome::Pending;
        };
        let readiness = self.ensure_buffer(key);
        self.start_channel(id, readiness)
    }

    fn start_channel(&mut self, id: SourceId, readiness: BufferReadiness) -> PlayOutcome {
        if readiness != BufferReadiness::Ready {
            return PlayOutcome::Pending;
        }
        let Some(idx) = self.setup_channel(id) else {
            return PlayOutcome::NoChannel;
        };
        self.update_channel_buffer(idx);

        let slave = self.sources.get(&id).is_some_and(AudioSource::is_sync_slave);
        if let Some(slot) = self.channel_slot_mut(idx) {
            slot.waiting_for_sync = slave;
        }
        if slave {
            return PlayOutcome::Waiting;
        }
        if self.channel_play(idx) {
            PlayOutcome::Playing
        } else {
            PlayOutcome::Pending
        }
    }

    /// Attach `key` to a source as its current, queued or preload asset.
    fn add_audio_data(&mut self, id: SourceId, key: AssetKey, set_current: bool) -> Placement {
        let Some(source) = self.sources.get_mut(&id) else {
            return Placement::Dropped;
        };

        let placement = if set_current {
            let current = source.current;
            match current {
                None => {
                    source.current = Some(key);
                    Placement::Current
                },
                Some(current) if source.queues_sounds() => {
                    if source.queued.is_some() || (current == key && source.is_loop()) {
                        Placement::Dropped
                    } else {
                        source.queued = Some(key);
                        Placement::Queued
                    }
                },
                Some(current) if current != key => {
                    source.current = Some(key);
                    Placement::Current
                },
                Some(_) => Placement::Unchanged,
            }
        } else {
            source.preloads.insert(key);
            Placement::Preload
        };

        let channel = source.channel;
        if placement == Placement::Current {
            if let Some(idx) = channel {
                self.update_channel_buffer(idx);
                self.channel_play(idx);
            }
        }
        if matches!(placement, Placement::Current | Placement::Queued | Placement::Preload) {
            self.start_next_transfer();
        }
        placement
    }

    /// Source is finished and may be reaped.
    fn source_done(&self, source: &AudioSource, now: Duration) -> bool {
        if source.is_loop() {
            return false;
        }
        let preload_pending = source.preloads().any(|key| {
            self.assets
                .get(&key)
                .is_some_and(|asset| asset.has_valid_data() && !asset.has_decoded_data())
        });
        if preload_pending || source.queued.is_some() {
            return false;
        }

        let age = source.age(now);
        let finished = age.as_secs_f32() > self.config.unplayed_timeout_secs || source.played_once;
        match source.channel {
            Some(idx) if self.channel_is_playing(idx) => {
                age.as_secs_f32() > self.config.max_source_age_secs
            },
            _ => finished,
        }
    }

    /// Whether a source would be reaped on the next frame.
    pub fn is_source_done(&self, id: SourceId) -> bool {
        let now = self.clock.now();
        self.sources.get(&id).is_some_and(|source| self.source_done(source, now))
    }

    /// Scheduling state of a source.
    pub fn source_state(&self, id: SourceId) -> Option<SourceState> {
        let source = self.sources.get(&id)?;
        Some(match source.channel {
            None if asset_buffer(&self.assets, source.current).is_some() => {
                SourceState::PendingChannel
            },
            None => SourceState::Unbound,
            Some(idx) if self.channel_is_playing(idx) => SourceState::Playing,
            Some(_) => SourceState::Stalled,
        })
    }

    // ------------------------------------------------------------------
    // Channel pool
    // ------------------------------------------------------------------

    /// Get a channel for a source that already has its buffer.
    fn setup_channel(&mut self, id: SourceId) -> Option<usize> {
        let source = self.sources.get(&id)?;
        asset_buffer(&self.assets, source.current)?;
        if let Some(idx) = source.channel {
            return Some(idx);
        }

        let listener = self.listener.position;
        let source = self.sources.get_mut(&id)?;
        source.update_priority(listener);
        let priority = source.priority();

        let idx = self.get_free_channel(priority)?;
        self.bind_channel(idx, id);
        Some(idx)
    }

    /// Hand out a channel slot to a request at `priority`.
    ///
    /// Unallocated slots first, then idle ones, then the lowest-priority
    /// busy slot if `priority` strictly beats it.
    fn get_free_channel(&mut self, priority: f32) -> Option<usize> {
        if let Some(idx) = self.channels.iter().position(Option::is_none) {
            return match self.backend.create_channel() {
                Ok(channel) => {
                    self.channels[idx] = Some(ChannelSlot::new(channel));
                    trace!("Allocated channel {idx}");
                    Some(idx)
                },
                Err(e) => {
                    warn!("Failed to create channel {idx}: {e}");
                    None
                },
            };
        }

        let idle = self
            .channels
            .iter()
            .position(|slot| slot.as_ref().is_some_and(ChannelSlot::is_idle));
        if let Some(idx) = idle {
            self.release_channel(idx);
            return Some(idx);
        }

        let mut victim: Option<(usize, f32)> = None;
        for (idx, slot) in self.channels.iter().enumerate() {
            let Some(slot) = slot else {
                continue;
            };
            let bound = slot
                .source
                .and_then(|id| self.sources.get(&id))
                .map_or(f32::MIN, AudioSource::priority);
            if victim.map_or(true, |(_, lowest)| bound < lowest) {
                victim = Some((idx, bound));
            }
        }

        let (idx, lowest) = victim?;
        if priority <= lowest {
            trace!("Refusing channel: priority {priority} does not beat {lowest}");
            return None;
        }
        info!("Preempting channel {idx} (priority {lowest} < {priority})");
        self.release_channel(idx);
        Some(idx)
    }

    fn bind_channel(&mut self, idx: usize, id: SourceId) {
        let Some(slot) = self.channel_slot_mut(idx) else {
            return;
        };
        if slot.source == Some(id) {
            return;
        }
        debug_assert!(slot.source.is_none(), "binding over live channel {idx}");
        if slot.source.is_some() {
            error!("Channel {idx} still bound while binding source {id}");
            self.release_channel(idx);
        }

        if let Some(slot) = self.channel_slot_mut(idx) {
            slot.source = Some(id);
        }
        if let Some(source) = self.sources.get_mut(&id) {
            source.channel = Some(idx);
        }
        self.update_channel_buffer(idx);
        self.update_channel_3d(idx);
        debug!("Bound source {id} to channel {idx}");
    }

    /// Unbind a channel from its source and buffer, keeping the slot.
    fn release_channel(&mut self, idx: usize) {
        let Some(slot) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        let Some(old) = slot.release() else {
            return;
        };
        if let Some(source) = self.sources.get_mut(&old) {
            debug_assert_eq!(source.channel, Some(idx), "source {old} link mismatch");
            source.channel = None;
        }
    }

    /// Bring a channel's buffer in line with its source's current asset.
    ///
    /// Returns true when a new buffer was attached.
    fn update_channel_buffer(&mut self, idx: usize) -> bool {
        let now = self.clock.now();
        let Some(slot) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return false;
        };
        let Some(id) = slot.source else {
            return false;
        };
        let source = self.sources.get(&id);
        debug_assert!(source.is_some(), "channel {idx} bound to missing source {id}");
        let Some(source) = source else {
            error!("Channel {idx} bound to missing source {id}");
            return false;
        };

        slot.secondary_gain = self.secondary_gains[source.sound_type().index()];
        slot.channel.set_gain(source.gain() * slot.secondary_gain);

        let wanted = asset_buffer(&self.assets, source.current);
        if wanted == slot.buffer {
            if let Some(buffer) = wanted.and_then(|b| self.buffers.get_mut(b)).and_then(Option::as_mut) {
                buffer.touch(now);
            }
            return false;
        }

        slot.channel.cleanup();
        slot.buffer = None;
        let Some(b) = wanted else {
            return false;
        };
        let Some(buffer) = self.buffers.get_mut(b).and_then(Option::as_mut) else {
            return false;
        };
        buffer.touch(now);
        if let Err(e) = slot.channel.attach(&buffer.buffer, source.is_loop()) {
            warn!("Channel {idx}: {e}");
            return false;
        }
        slot.buffer = Some(b);
        true
    }

    fn update_channel_3d(&mut self, idx: usize) {
        let Some(slot) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        let Some(source) = slot.source.and_then(|id| self.sources.get(&id)) else {
            return;
        };
        let emitter = if source.is_ambient() {
            Emitter::Ambient
        } else {
            Emitter::Positioned {
                position: source.position(),
                velocity: source.velocity(),
            }
        };
        slot.channel.update_3d(&emitter, &self.listener);
    }

    fn update_channel_loop(&mut self, idx: usize) {
        let Some(slot) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        if slot.source.is_some() && slot.channel.poll_looped() {
            slot.looped_this_frame = true;
        }
    }

    /// Start a bound channel that has a buffer. Returns false if there is
    /// nothing to play.
    fn channel_play(&mut self, idx: usize) -> bool {
        let Some(slot) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return false;
        };
        let Some(id) = slot.source else {
            return false;
        };
        if slot.buffer.is_none() {
            return false;
        }
        if !slot.channel.is_playing() {
            slot.channel.play();
            if let Some(source) = self.sources.get_mut(&id) {
                source.played_once = true;
            }
        }
        true
    }

    fn channel_slot(&self, idx: usize) -> Option<&ChannelSlot<B::Channel>> {
        self.channels.get(idx).and_then(Option::as_ref)
    }

    fn channel_slot_mut(&mut self, idx: usize) -> Option<&mut ChannelSlot<B::Channel>> {
        self.channels.get_mut(idx).and_then(Option::as_mut)
    }

    fn channel_is_playing(&self, idx: usize) -> bool {
        self.channel_slot(idx).is_some_and(ChannelSlot::is_playing)
    }

    fn looped_this_frame(&self, idx: usize) -> bool {
        self.channel_slot(idx).is_some_and(ChannelSlot::looped_this_frame)
    }

    /// Channel pool slot, `None` if unallocated or out of range.
    pub fn channel(&self, idx: usize) -> Option<&ChannelSlot<B::Channel>> {
        self.channel_slot(idx)
    }

    /// Mutable backend channel in a pool slot.
    pub fn channel_backend_mut(&mut self, idx: usize) -> Option<&mut B::Channel> {
        self.channel_slot_mut(idx).map(|slot| &mut slot.channel)
    }

    /// Channel pool size.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    // ------------------------------------------------------------------
    // Buffer pool
    // ------------------------------------------------------------------

    /// Make sure `key` has a buffer or is on its way to one.
    fn ensure_buffer(&mut self, key: AssetKey) -> BufferReadiness {
        let Some(asset) = self.assets.get(&key) else {
            return BufferReadiness::Unavailable;
        };
        if asset.buffer().is_some() {
            return BufferReadiness::Ready;
        }
        if !asset.has_valid_data() {
            return BufferReadiness::Unavailable;
        }
        if asset.has_decoded_data() {
            if self.load_asset(key) {
                return BufferReadiness::Ready;
            }
            if self.assets.get(&key).is_some_and(AudioAsset::has_decoded_data) {
                // Decoded but the pool is exhausted.
                return BufferReadiness::Pending;
            }
        }

        if !self.assets.get(&key).is_some_and(AudioAsset::has_local_data) {
            return BufferReadiness::Unavailable;
        }
        if self.decoder.request_decode(key) {
            return BufferReadiness::Pending;
        }
        if let Some(asset) = self.assets.get_mut(&key) {
            debug!("Local bytes for {key} are gone, will refetch");
            asset.mark_local_lost();
        }
        BufferReadiness::Unavailable
    }

    /// Load decoded data for `key` into a pool buffer.
    fn load_asset(&mut self, key: AssetKey) -> bool {
        match self.assets.get(&key) {
            None => return false,
            Some(asset) if asset.buffer().is_some() => return true,
            Some(_) => {},
        }

        let Some(sound) = self.decoder.decoded(key) else {
            warn!("Asset {key} marked decoded but decoder has no data");
            if let Some(asset) = self.assets.get_mut(&key) {
                asset.mark_decoded_lost();
            }
            return false;
        };

        let Some(idx) = self.get_free_buffer() else {
            debug!("No free buffer for asset {key}");
            return false;
        };
        let now = self.clock.now();
        let Some(slot) = self.buffers.get_mut(idx).and_then(Option::as_mut) else {
            return false;
        };

        let loaded = slot.buffer.load(key, &sound);
        match loaded {
            Ok(()) => {
                slot.asset = Some(key);
                slot.last_used = now;
                if let Some(asset) = self.assets.get_mut(&key) {
                    asset.set_buffer(Some(idx));
                }
                trace!("Loaded asset {key} into buffer {idx}");
                true
            },
            Err(e) => {
                warn!("{e}");
                self.buffers[idx] = None;
                false
            },
        }
    }

    /// Allocate an empty buffer slot or take over the oldest unused one.
    fn get_free_buffer(&mut self) -> Option<usize> {
        let now = self.clock.now();
        if let Some(idx) = self.buffers.iter().position(Option::is_none) {
            self.buffers[idx] = Some(BufferSlot::new(self.backend.create_buffer(), now));
            return Some(idx);
        }

        let bound: Vec<usize> = self.channels.iter().flatten().filter_map(|c| c.buffer).collect();
        let (idx, _) = self
            .buffers
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|slot| (idx, slot)))
            .filter(|(idx, slot)| !slot.in_use && !bound.contains(idx))
            .min_by_key(|(_, slot)| slot.last_used)?;

        info!("Taking over unused buffer {idx}");
        if let Some(asset) = self.buffers[idx]
            .as_ref()
            .and_then(|slot| slot.asset)
            .and_then(|key| self.assets.get_mut(&key))
        {
            asset.set_buffer(None);
        }
        self.buffers[idx] = Some(BufferSlot::new(self.backend.create_buffer(), now));
        Some(idx)
    }

    /// Buffer pool slot, `None` if empty or out of range.
    pub fn buffer(&self, idx: usize) -> Option<&BufferSlot<B::Buffer>> {
        self.buffers.get(idx).and_then(Option::as_ref)
    }

    /// Buffer pool size.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    // ------------------------------------------------------------------
    // Assets and transfers
    // ------------------------------------------------------------------

    /// Asset for `key`, created with the collaborators' view of it if new.
    pub fn get_or_create_asset(&mut self, key: AssetKey) -> &AudioAsset {
        let decoder = &self.decoder;
        let fetcher = &self.fetcher;
        self.assets.entry(key).or_insert_with(|| {
            AudioAsset::new(key, fetcher.has_local_bytes(key), decoder.has_decoded(key))
        })
    }

    /// Look up an asset.
    pub fn asset(&self, key: AssetKey) -> Option<&AudioAsset> {
        self.assets.get(&key)
    }

    /// Register `key` and request its decode.
    ///
    /// Returns true if local bytes exist and a decode is queued or already
    /// done. False means the data has to be fetched first.
    pub fn preload_asset(&mut self, key: AssetKey) -> bool {
        if key.is_null() {
            return false;
        }
        if !self.get_or_create_asset(key).has_valid_data() {
            return false;
        }
        self.decoder.request_decode(key)
    }

    /// Encoded bytes for `key` are on local storage.
    pub fn has_local_bytes(&self, key: AssetKey) -> bool {
        self.fetcher.has_local_bytes(key)
    }

    /// Decoded data exists for `key`.
    pub fn has_decoded_bytes(&self, key: AssetKey) -> bool {
        self.decoder.has_decoded(key)
    }

    /// Asset fetch in flight.
    pub const fn current_transfer(&self) -> Option<AssetKey> {
        self.current_transfer
    }

    /// A fetch finished.
    ///
    /// Success makes the asset local and queues a decode. Failure poisons
    /// the asset so it is never requested again. Either way the next fetch
    /// is started.
    pub fn fetch_completed(&mut self, key: AssetKey, success: bool) {
        match self.assets.get_mut(&key) {
            Some(asset) if success => {
                asset.mark_fetched();
                self.decoder.request_decode(key);
            },
            Some(asset) => {
                warn!("Fetch of asset {key} failed, marking invalid");
                asset.mark_fetch_failed();
            },
            None => warn!("Fetch completion for unknown asset {key}"),
        }

        self.current_transfer = None;
        self.start_next_transfer();
    }

    /// Issue a fetch for the most wanted non-local asset, if none is in
    /// flight.
    fn start_next_transfer(&mut self) {
        if self.current_transfer.is_some() || self.muted {
            return;
        }
        let Some(key) = self.next_transfer_candidate() else {
            return;
        };
        info!("Requesting asset data for {key}");
        self.current_transfer = Some(key);
        self.fetcher.request_fetch(key);
    }

    /// Bound channels' current, then queued, then preload assets; then
    /// everything any source references.
    fn next_transfer_candidate(&self) -> Option<AssetKey> {
        let needs_fetch = |key: AssetKey| self.assets.get(&key).is_some_and(AudioAsset::needs_fetch);
        let bound: Vec<&AudioSource> = self
            .channels
            .iter()
            .flatten()
            .filter_map(|slot| slot.source)
            .filter_map(|id| self.sources.get(&id))
            .collect();

        pick_by_priority(bound.iter().copied(), |s| s.current.filter(|k| needs_fetch(*k)))
            .or_else(|| {
                pick_by_priority(bound.iter().copied(), |s| s.queued.filter(|k| needs_fetch(*k)))
            })
            .or_else(|| {
                pick_by_priority(bound.iter().copied(), |s| s.preloads().find(|k| needs_fetch(*k)))
            })
            .or_else(|| {
                pick_by_priority(self.sources.values(), |s| {
                    s.current
                        .filter(|k| needs_fetch(*k))
                        .or_else(|| s.queued.filter(|k| needs_fetch(*k)))
                        .or_else(|| s.preloads().find(|k| needs_fetch(*k)))
                })
            })
    }

    // ------------------------------------------------------------------
    // Gain
    // ------------------------------------------------------------------

    /// Mute or unmute. While muted no new sounds start and no fetches are
    /// issued.
    pub fn set_muted(&mut self, muted: bool) {
        if self.muted != muted {
            info!("Audio {}", if muted { "muted" } else { "unmuted" });
        }
        self.muted = muted;
    }

    /// Check if muted.
    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    /// Set master gain (0.0 - 1.0).
    pub fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain.clamp(0.0, 1.0);
        if !self.muted {
            self.backend.set_internal_gain(self.master_gain);
        }
    }

    /// Master gain.
    pub const fn master_gain(&self) -> f32 {
        self.master_gain
    }

    /// Set the gain multiplier for a sound type (0.0 - 1.0).
    pub fn set_secondary_gain(&mut self, sound_type: SoundType, gain: f32) {
        self.secondary_gains[sound_type.index()] = gain.clamp(0.0, 1.0);
    }

    /// Gain multiplier for a sound type.
    pub const fn secondary_gain(&self, sound_type: SoundType) -> f32 {
        self.secondary_gains[sound_type.index()]
    }

    // ------------------------------------------------------------------
    // Listener
    // ------------------------------------------------------------------

    /// Listener state.
    pub const fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Set the full listener transform.
    pub fn set_listener(&mut self, position: Vec3, velocity: Vec3, up: Vec3, at: Vec3) {
        self.listener.position = position;
        self.listener.velocity = velocity;
        self.listener.orient(up, at);
    }

    /// Set listener position.
    pub fn set_listener_position(&mut self, position: Vec3) {
        self.listener.position = position;
    }

    /// Listener position.
    pub const fn listener_position(&self) -> Vec3 {
        self.listener.position
    }

    /// Set listener velocity.
    pub fn set_listener_velocity(&mut self, velocity: Vec3) {
        self.listener.velocity = velocity;
    }

    /// Move the listener by an offset.
    pub fn translate_listener(&mut self, offset: Vec3) {
        self.listener.translate(offset);
    }

    /// Set listener orientation.
    pub fn orient_listener(&mut self, up: Vec3, at: Vec3) {
        self.listener.orient(up, at);
    }

    /// Set doppler factor.
    pub fn set_doppler_factor(&mut self, factor: f32) {
        self.listener.doppler_factor = factor.max(0.0);
    }

    /// Doppler factor.
    pub const fn doppler_factor(&self) -> f32 {
        self.listener.doppler_factor
    }

    /// Set distance factor.
    pub fn set_distance_factor(&mut self, factor: f32) {
        self.listener.distance_factor = factor.max(0.0);
    }

    /// Distance factor.
    pub const fn distance_factor(&self) -> f32 {
        self.listener.distance_factor
    }

    /// Set rolloff factor.
    pub fn set_rolloff_factor(&mut self, factor: f32) {
        self.listener.rolloff_factor = factor.max(0.0);
    }

    /// Rolloff factor.
    pub const fn rolloff_factor(&self) -> f32 {
        self.listener.rolloff_factor
    }

    /// Push batched listener and global 3D changes to the backend.
    pub fn commit_deferred_changes(&mut self) {
        self.backend.commit_deferred_changes(&self.listener);
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Snapshot of pool and table usage.
    pub fn stats(&self) -> EngineStats {
        let channels = || self.channels.iter().flatten();
        let buffers = || self.buffers.iter().flatten();
        EngineStats {
            sources: self.sources.len(),
            assets: self.assets.len(),
            decoded_assets: self.assets.values().filter(|a| a.has_decoded_data()).count(),
            invalid_assets: self.assets.values().filter(|a| !a.has_valid_data()).count(),
            channels_allocated: channels().count(),
            channels_bound: channels().filter(|c| c.source.is_some()).count(),
            channels_playing: channels().filter(|c| c.is_playing()).count(),
            buffers_allocated: buffers().count(),
            buffers_in_use: buffers().filter(|b| b.in_use).count(),
            current_transfer: self.current_transfer,
            muted: self.muted,
            master_gain: self.master_gain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DecodedSound;
    use crate::clock::ManualClock;
    use crate::headless::{HeadlessBackend, MemoryAssetStore};

    fn one_second() -> DecodedSound {
        DecodedSound::silence(Duration::from_secs(1), 8000, 1)
    }

    fn setup(channels: usize, buffers: usize) -> (AudioEngine<HeadlessBackend>, ManualClock, MemoryAssetStore) {
        let clock = ManualClock::new();
        let store = MemoryAssetStore::new();
        let config = AudioConfig::default().with_max_buffers(buffers);
        let mut engine =
            AudioEngine::headless(&store, Arc::new(clock.clone()), config).expect("engine");
        engine.init(channels).expect("init");
        (engine, clock, store)
    }

    fn decoded_asset(store: &MemoryAssetStore) -> AssetKey {
        let key = AssetKey::new();
        store.insert_decoded(key, one_second());
        key
    }

    fn positioned(engine: &mut AudioEngine<HeadlessBackend>, distance: f32) -> SourceId {
        engine.add_source(
            AudioSource::new(OwnerId::NOBODY, 1.0, SoundType::Sfx)
                .with_position(Vec3::new(distance, 0.0, 0.0)),
        )
    }

    #[test]
    fn test_init_validates_channel_count() {
        let store = MemoryAssetStore::new();
        let clock = Arc::new(ManualClock::new());
        let mut engine =
            AudioEngine::headless(&store, clock, AudioConfig::default()).expect("engine");

        assert!(matches!(engine.init(0), Err(AudioError::InvalidChannelCount { .. })));
        assert!(matches!(engine.init(31), Err(AudioError::InvalidChannelCount { .. })));
        assert!(engine.init(4).is_ok());
        assert!(engine.is_initialized());
        assert_eq!(engine.channel_count(), 4);
        assert_eq!(engine.buffer_count(), crate::config::MAX_BUFFERS);
    }

    #[test]
    fn test_idle_before_init_is_noop() {
        let store = MemoryAssetStore::new();
        let clock = Arc::new(ManualClock::new());
        let mut engine =
            AudioEngine::headless(&store, clock, AudioConfig::default()).expect("engine");
        engine.idle(0.01);
        assert_eq!(engine.backend().tick_count(), 0);
    }

    #[test]
    fn test_trigger_decoded_plays_immediately() {
        let (mut engine, _clock, store) = setup(4, 8);
        let key = decoded_asset(&store);

        let id = engine
            .trigger_sound(key, OwnerId::NOBODY, 1.0, SoundType::Sfx, None)
            .expect("source");

        assert_eq!(engine.source_state(id), Some(SourceState::Playing));
        let source = engine.find_source(id).expect("source");
        assert!(source.played_once());
        assert_eq!(source.priority(), f32::MAX);
    }

    #[test]
    fn test_equal_priority_never_preempts() {
        let (mut engine, _clock, store) = setup(1, 8);
        let key = decoded_asset(&store);

        let a = positioned(&mut engine, 3.0);
        assert_eq!(engine.play(a, key), Some(PlayOutcome::Playing));

        let b = positioned(&mut engine, -3.0);
        assert_eq!(engine.play(b, key), Some(PlayOutcome::NoChannel));

        assert_eq!(engine.channel(0).and_then(ChannelSlot::source), Some(a));
        assert!(engine.find_source(b).and_then(AudioSource::channel).is_none());
    }

    #[test]
    fn test_equal_priority_candidates_first_in_order_wins() {
        let (mut engine, clock, store) = setup(1, 8);
        let key = decoded_asset(&store);

        let holder = positioned(&mut engine, 1.0);
        assert_eq!(engine.play(holder, key), Some(PlayOutcome::Playing));

        let a = positioned(&mut engine, 3.0);
        let b = positioned(&mut engine, -3.0);
        assert_eq!(engine.play(a, key), Some(PlayOutcome::NoChannel));
        assert_eq!(engine.play(b, key), Some(PlayOutcome::NoChannel));
        assert_eq!(engine.source_state(a), Some(SourceState::PendingChannel));
        assert_eq!(engine.source_state(b), Some(SourceState::PendingChannel));

        assert!(engine.release_source(holder));
        let (first, second) = if a < b { (a, b) } else { (b, a) };

        engine.idle(0.01);
        assert_eq!(engine.channel(0).and_then(ChannelSlot::source), Some(first));
        assert_eq!(engine.source_state(first), Some(SourceState::Playing));

        for _ in 0..5 {
            clock.advance_secs(0.1);
            engine.idle(0.01);
            assert_eq!(engine.channel(0).and_then(ChannelSlot::source), Some(first));
            assert_eq!(engine.source_state(second), Some(SourceState::PendingChannel));
        }
    }

    #[test]
    fn test_idle_survives_any_decode_budget() {
        let (mut engine, _clock, store) = setup(2, 8);
        let key = decoded_asset(&store);
        let id = engine
            .trigger_sound(key, OwnerId::NOBODY, 1.0, SoundType::Sfx, None)
            .expect("source");

        for budget in [1.0e20, f32::MAX, f32::INFINITY, f32::NAN, -1.0, 0.0, 1.0e-12] {
            engine.idle(budget);
        }
        assert_eq!(engine.source_state(id), Some(SourceState::Playing));
    }

    #[test]
    fn test_huge_stale_threshold_rejected_at_construction() {
        let store = MemoryAssetStore::new();
        let clock = Arc::new(ManualClock::new());
        let config = AudioConfig::default().with_buffer_stale_secs(1.0e30);
        assert!(matches!(
            AudioEngine::headless(&store, clock, config),
            Err(AudioError::Config(_))
        ));
    }

    #[test]
    fn test_non_finite_source_never_preempts() {
        let (mut engine, _clock, store) = setup(1, 8);
        let key = decoded_asset(&store);

        let far = positioned(&mut engine, 50.0);
        assert_eq!(engine.play(far, key), Some(PlayOutcome::Playing));

        let nan = positioned(&mut engine, f32::NAN);
        assert_eq!(engine.play(nan, key), Some(PlayOutcome::NoChannel));
        engine.idle(0.01);

        assert_eq!(engine.channel(0).and_then(ChannelSlot::source), Some(far));
        let priority = engine.find_source(nan).map_or(1.0, AudioSource::priority);
        assert!(priority.abs() < f32::EPSILON);
    }

    #[test]
    fn test_higher_priority_preempts_lowest() {
        let (mut engine, _clock, store) = setup(2, 8);
        let key = decoded_asset(&store);

        let far = positioned(&mut engine, 10.0);
        let mid = positioned(&mut engine, 5.0);
        engine.play(far, key);
        engine.play(mid, key);

        let near = positioned(&mut engine, 1.0);
        assert_eq!(engine.play(near, key), Some(PlayOutcome::Playing));

        assert!(engine.find_source(far).and_then(AudioSource::channel).is_none());
        assert!(engine.find_source(mid).and_then(AudioSource::channel).is_some());
        assert!(engine.find_source(near).and_then(AudioSource::channel).is_some());
    }

    #[test]
    fn test_idle_channel_reused_before_preempting() {
        let (mut engine, _clock, store) = setup(1, 8);
        let key = decoded_asset(&store);

        let a = positioned(&mut engine, 1.0);
        engine.play(a, key);
        engine.channel_backend_mut(0).expect("channel").force_stop();

        // Far quieter source still gets the idle channel.
        let b = positioned(&mut engine, 50.0);
        assert_eq!(engine.play(b, key), Some(PlayOutcome::Playing));
        assert!(engine.find_source(a).and_then(AudioSource::channel).is_none());
    }

    #[test]
    fn test_play_null_is_idempotent() {
        let (mut engine, _clock, store) = setup(2, 8);
        let key = decoded_asset(&store);
        let id = positioned(&mut engine, 1.0);
        engine.play(id, key);

        assert_eq!(engine.play(id, AssetKey::NULL), Some(PlayOutcome::Stopped));
        let channel = engine.channel(0).expect("slot");
        assert!(channel.source().is_none());
        assert!(channel.buffer().is_none());
        let first = engine.stats();

        assert_eq!(engine.play(id, AssetKey::NULL), Some(PlayOutcome::Stopped));
        assert_eq!(engine.stats(), first);
        let source = engine.find_source(id).expect("source");
        assert!(source.current_asset().is_none());
        assert!(source.channel().is_none());
    }

    #[test]
    fn test_play_unknown_source() {
        let (mut engine, _clock, _store) = setup(1, 8);
        assert_eq!(engine.play(SourceId::new(), AssetKey::new()), None);
        assert!(!engine.release_source(SourceId::new()));
    }

    #[test]
    fn test_release_source_frees_channel() {
        let (mut engine, _clock, store) = setup(1, 8);
        let key = decoded_asset(&store);
        let id = positioned(&mut engine, 1.0);
        engine.play(id, key);

        assert!(engine.release_source(id));
        assert!(engine.find_source(id).is_none());
        assert!(engine.channel(0).and_then(ChannelSlot::source).is_none());
    }

    #[test]
    fn test_muted_trigger_and_fetch() {
        let (mut engine, _clock, store) = setup(2, 8);
        let remote = AssetKey::new();
        store.insert_remote(remote, one_second());

        engine.set_muted(true);
        assert!(engine.trigger_sound(remote, OwnerId::NOBODY, 1.0, SoundType::Sfx, None).is_none());

        // A caller-built source still registers, but nothing is fetched.
        let id = positioned(&mut engine, 1.0);
        assert_eq!(engine.play(id, remote), Some(PlayOutcome::Pending));
        engine.idle(0.01);
        assert!(engine.current_transfer().is_none());
        assert!((engine.backend().internal_gain()).abs() < f32::EPSILON);

        engine.set_muted(false);
        engine.idle(0.01);
        assert_eq!(engine.current_transfer(), Some(remote));
        assert!((engine.backend().internal_gain() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_local_asset_decodes_then_plays() {
        let (mut engine, _clock, store) = setup(2, 8);
        let key = AssetKey::new();
        store.insert_local(key, one_second());

        let id = engine
            .trigger_sound(key, OwnerId::NOBODY, 1.0, SoundType::Sfx, Some(Vec3::X))
            .expect("source");
        assert_eq!(engine.source_state(id), Some(SourceState::Unbound));

        // Decode happens at the end of the first frame, load at the start of the next.
        engine.idle(0.01);
        assert!(engine.asset(key).is_some_and(AudioAsset::has_decoded_data));
        engine.idle(0.01);
        assert_eq!(engine.source_state(id), Some(SourceState::Playing));
    }

    #[test]
    fn test_fetch_success_then_decode() {
        let (mut engine, _clock, store) = setup(2, 8);
        let key = AssetKey::new();
        store.insert_remote(key, one_second());

        let id = engine
            .trigger_sound(key, OwnerId::NOBODY, 1.0, SoundType::Sfx, None)
            .expect("source");
        assert_eq!(engine.current_transfer(), Some(key));
        assert_eq!(store.fetch_requests(), vec![key]);

        for _ in 0..3 {
            engine.idle(0.01);
        }
        let asset = engine.asset(key).expect("asset");
        assert!(asset.has_local_data());
        assert!(asset.has_decoded_data());
        assert!(engine.current_transfer().is_none());
        assert_eq!(engine.source_state(id), Some(SourceState::Playing));
    }

    #[test]
    fn test_fetch_completed_explicit() {
        let (mut engine, _clock, _store) = setup(1, 8);
        let key = AssetKey::new();
        engine.get_or_create_asset(key);

        engine.fetch_completed(key, false);
        let asset = engine.asset(key).expect("asset");
        assert!(!asset.has_valid_data());
        assert!(!asset.needs_fetch());
        assert!(!engine.preload_asset(key));
    }

    #[test]
    fn test_preload_asset() {
        let (mut engine, _clock, store) = setup(1, 8);
        let local = AssetKey::new();
        store.insert_local(local, one_second());
        let remote = AssetKey::new();
        store.insert_remote(remote, one_second());

        assert!(engine.preload_asset(local));
        assert!(!engine.preload_asset(remote));
        assert!(!engine.preload_asset(AssetKey::NULL));
        assert!(engine.asset(remote).is_some());

        engine.idle(0.01);
        assert!(engine.has_decoded_bytes(local));
        assert!(!engine.has_local_bytes(remote));
    }

    #[test]
    fn test_pending_preload_keeps_source_alive() {
        let (mut engine, clock, store) = setup(1, 8);
        let preload = AssetKey::new();
        store.insert_remote(preload, one_second());

        let id = positioned(&mut engine, 1.0);
        assert!(!engine.preload_source_asset(id, preload));
        let source = engine.find_source(id).expect("source");
        assert_eq!(source.preloads().collect::<Vec<_>>(), vec![preload]);

        clock.advance_secs(20.0);
        assert!(!engine.is_source_done(id));

        // Once decoded, the unplayed timeout applies again.
        store.insert_decoded(preload, one_second());
        engine.fetch_completed(preload, true);
        engine.idle(0.01);
        assert!(engine.asset(preload).is_some_and(AudioAsset::has_decoded_data));
        assert!(engine.is_source_done(id));
    }

    #[test]
    fn test_unplayed_source_reaped_after_timeout() {
        let (mut engine, clock, _store) = setup(1, 8);
        let key = AssetKey::new();
        let id = positioned(&mut engine, 1.0);
        engine.play(id, key);

        clock.advance_secs(14.9);
        engine.idle(0.01);
        assert!(engine.find_source(id).is_some());

        clock.advance_secs(0.2);
        engine.idle(0.01);
        assert!(engine.find_source(id).is_none());
    }

    #[test]
    fn test_finished_one_shot_reaped() {
        let (mut engine, clock, store) = setup(1, 8);
        let key = decoded_asset(&store);
        let id = engine
            .trigger_sound(key, OwnerId::NOBODY, 1.0, SoundType::Sfx, None)
            .expect("source");

        clock.advance_secs(0.5);
        engine.idle(0.01);
        assert_eq!(engine.source_state(id), Some(SourceState::Playing));
        assert!(!engine.is_source_done(id));

        clock.advance_secs(0.6);
        assert_eq!(engine.source_state(id), Some(SourceState::Stalled));
        assert!(engine.is_source_done(id));
        engine.idle(0.01);
        assert!(engine.find_source(id).is_none());
        assert!(engine.channel(0).and_then(ChannelSlot::source).is_none());
    }

    #[test]
    fn test_playing_one_shot_cut_off_at_max_age() {
        let (mut engine, clock, store) = setup(1, 8);
        let key = AssetKey::new();
        store.insert_decoded(key, DecodedSound::silence(Duration::from_secs(120), 100, 1));
        let id = engine
            .trigger_sound(key, OwnerId::NOBODY, 1.0, SoundType::Sfx, None)
            .expect("source");

        clock.advance_secs(59.0);
        engine.idle(0.01);
        assert!(engine.find_source(id).is_some());

        clock.advance_secs(2.0);
        engine.idle(0.01);
        assert!(engine.find_source(id).is_none());
    }

    #[test]
    fn test_buffer_staleness_threshold() {
        let (mut engine, clock, store) = setup(1, 8);
        let key = decoded_asset(&store);
        let id = engine
            .trigger_sound(key, OwnerId::NOBODY, 1.0, SoundType::Sfx, None)
            .expect("source");
        engine.idle(0.01);
        let buffer = engine.asset(key).and_then(AudioAsset::buffer).expect("buffer");

        engine.play(id, AssetKey::NULL);
        engine.idle(0.01);
        assert!(engine.find_source(id).is_none());

        clock.advance_secs(29.9);
        engine.idle(0.01);
        assert_eq!(engine.asset(key).and_then(AudioAsset::buffer), Some(buffer));
        assert!(engine.buffer(buffer).is_some());

        clock.advance_secs(0.2);
        engine.idle(0.01);
        assert!(engine.asset(key).and_then(AudioAsset::buffer).is_none());
        assert!(engine.buffer(buffer).is_none());
    }

    #[test]
    fn test_buffer_takeover_picks_oldest_unused() {
        let (mut engine, clock, store) = setup(1, 2);
        let first = decoded_asset(&store);
        let second = decoded_asset(&store);
        let third = decoded_asset(&store);

        assert!(engine.preload_asset(first));
        engine.get_or_create_asset(second);
        assert_eq!(engine.ensure_buffer(first), BufferReadiness::Ready);
        clock.advance_secs(1.0);
        assert_eq!(engine.ensure_buffer(second), BufferReadiness::Ready);
        clock.advance_secs(1.0);

        engine.get_or_create_asset(third);
        assert_eq!(engine.ensure_buffer(third), BufferReadiness::Ready);
        assert!(engine.asset(first).and_then(AudioAsset::buffer).is_none());
        assert!(engine.asset(second).and_then(AudioAsset::buffer).is_some());
        assert!(engine.asset(third).and_then(AudioAsset::buffer).is_some());
    }

    #[test]
    fn test_bound_buffer_never_taken_over() {
        let (mut engine, _clock, store) = setup(1, 1);
        let playing = decoded_asset(&store);
        let other = decoded_asset(&store);

        let id = positioned(&mut engine, 1.0);
        engine.play(id, playing);

        engine.get_or_create_asset(other);
        assert_eq!(engine.ensure_buffer(other), BufferReadiness::Pending);
        assert!(engine.asset(playing).and_then(AudioAsset::buffer).is_some());
    }

    #[test]
    fn test_secondary_gain_applied() {
        let (mut engine, _clock, store) = setup(1, 8);
        let key = decoded_asset(&store);
        engine.set_secondary_gain(SoundType::Ui, 0.5);
        assert!((engine.secondary_gain(SoundType::Ui) - 0.5).abs() < f32::EPSILON);

        engine
            .trigger_sound(key, OwnerId::NOBODY, 0.8, SoundType::Ui, None)
            .expect("source");
        engine.idle(0.01);

        let slot = engine.channel(0).expect("slot");
        assert!((slot.secondary_gain() - 0.5).abs() < f32::EPSILON);
        assert!((slot.backend().gain() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_replace_current_without_queue() {
        let (mut engine, _clock, store) = setup(1, 8);
        let first = decoded_asset(&store);
        let second = decoded_asset(&store);
        let id = positioned(&mut engine, 1.0);
        engine.play(id, first);

        assert_eq!(engine.play(id, second), Some(PlayOutcome::Playing));
        let source = engine.find_source(id).expect("source");
        assert_eq!(source.current_asset(), Some(second));
        assert!(source.queued_asset().is_none());
        assert_eq!(
            engine.channel(0).and_then(ChannelSlot::buffer),
            engine.asset(second).and_then(AudioAsset::buffer)
        );
    }

    #[test]
    fn test_looping_queue_ignores_same_asset() {
        let (mut engine, _clock, store) = setup(1, 8);
        let key = decoded_asset(&store);
        let id = engine.add_source(
            AudioSource::new(OwnerId::NOBODY, 1.0, SoundType::Sfx)
                .with_looping(true)
                .with_queue_sounds(true),
        );
        engine.play(id, key);
        assert_eq!(engine.play(id, key), Some(PlayOutcome::Dropped));
        assert!(engine.find_source(id).and_then(AudioSource::queued_asset).is_none());
    }

    #[test]
    fn test_looping_queue_advances_on_loop_boundary() {
        let (mut engine, clock, store) = setup(1, 8);
        let first = decoded_asset(&store);
        let second = decoded_asset(&store);
        let id = engine.add_source(
            AudioSource::new(OwnerId::NOBODY, 1.0, SoundType::Sfx)
                .with_looping(true)
                .with_queue_sounds(true),
        );
        engine.play(id, first);
        assert_eq!(engine.play(id, second), Some(PlayOutcome::Queued));

        clock.advance_secs(0.5);
        engine.idle(0.01);
        assert_eq!(engine.find_source(id).and_then(AudioSource::current_asset), Some(first));

        clock.advance_secs(0.6);
        engine.idle(0.01);
        let source = engine.find_source(id).expect("source");
        assert_eq!(source.current_asset(), Some(second));
        assert!(source.queued_asset().is_none());
        assert_eq!(engine.source_state(id), Some(SourceState::Playing));
    }

    #[test]
    fn test_sync_slave_waits_for_master() {
        let (mut engine, _clock, store) = setup(2, 8);
        let key = decoded_asset(&store);
        let slave = engine.add_source(
            AudioSource::new(OwnerId::NOBODY, 1.0, SoundType::Sfx)
                .ambient()
                .with_sync_slave(true),
        );
        assert_eq!(engine.play(slave, key), Some(PlayOutcome::Waiting));

        // No master has looped, so the slave holds.
        engine.idle(0.01);
        let idx = engine.find_source(slave).and_then(AudioSource::channel).expect("channel");
        let slot = engine.channel(idx).expect("slot");
        assert!(slot.is_waiting());
        assert!(!slot.is_playing());
        assert_eq!(engine.source_state(slave), Some(SourceState::Stalled));
    }

    #[test]
    fn test_driver_name_and_commit() {
        let (mut engine, _clock, _store) = setup(1, 8);
        assert_eq!(engine.driver_name(false), "Headless");
        assert!(engine.driver_name(true).contains("Headless"));

        engine.set_listener(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, Vec3::Z, Vec3::Y);
        engine.set_rolloff_factor(-2.0);
        assert!(engine.rolloff_factor().abs() < f32::EPSILON);
        engine.commit_deferred_changes();
        assert_eq!(engine.backend().commit_count(), 1);
        assert_eq!(engine.backend().committed_listener().map(|l| l.position), Some(Vec3::new(1.0, 2.0, 3.0)));

        engine.idle(0.0);
        assert_eq!(engine.backend().commit_count(), 2);
        assert_eq!(engine.backend().tick_count(), 1);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (mut engine, _clock, store) = setup(2, 8);
        let key = decoded_asset(&store);
        engine.trigger_sound(key, OwnerId::NOBODY, 1.0, SoundType::Sfx, None);

        engine.shutdown();
        assert!(!engine.is_initialized());
        let stats = engine.stats();
        assert_eq!(stats.sources, 0);
        assert_eq!(stats.assets, 0);
        assert_eq!(stats.channels_allocated, 0);
        assert_eq!(stats.buffers_allocated, 0);
    }
}
