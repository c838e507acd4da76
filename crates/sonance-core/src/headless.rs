//! Headless backend and in-memory collaborators.
//!
//! [`HeadlessBackend`] simulates playback against a [`Clock`] without
//! touching any audio device: a channel "plays" from the moment it is
//! started until its buffer's duration has elapsed, and loops by counting
//! period boundaries. [`MemoryAssetStore`] provides a fetcher and a decoder
//! backed by shared maps. Together they run the engine in tests and in the
//! simulator.

use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use sonance_common::{AssetKey, AudioError, AudioResult};
use tracing::{debug, trace};

use crate::backend::{AudioBackend, BackendBuffer, BackendChannel, DecodedSound, Emitter};
use crate::clock::Clock;
use crate::config::AudioConfig;
use crate::decode::{DecodeEvent, DecodeQueue, Decoder};
use crate::engine::AudioEngine;
use crate::fetch::{AssetFetcher, FetchCompletion};
use crate::listener::Listener;

/// Engine running on the headless backend.
pub type HeadlessEngine = AudioEngine<HeadlessBackend>;

impl AudioEngine<HeadlessBackend> {
    /// Engine with a headless backend and `store`'s fetcher and decoder.
    pub fn headless(
        store: &MemoryAssetStore,
        clock: Arc<dyn Clock>,
        config: AudioConfig,
    ) -> AudioResult<Self> {
        Self::new(
            HeadlessBackend::new(Arc::clone(&clock)),
            store.decoder(),
            store.fetcher(),
            clock,
            config,
        )
    }
}

/// Clock-driven backend with no audio output.
pub struct HeadlessBackend {
    clock: Arc<dyn Clock>,
    internal_gain: f32,
    committed: Option<Listener>,
    commits: usize,
    ticks: usize,
    channels_created: usize,
}

impl std::fmt::Debug for HeadlessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBackend")
            .field("internal_gain", &self.internal_gain)
            .field("commits", &self.commits)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

impl HeadlessBackend {
    /// Create a backend timed by `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            internal_gain: 1.0,
            committed: None,
            commits: 0,
            ticks: 0,
            channels_created: 0,
        }
    }

    /// Last gain pushed by the engine.
    pub const fn internal_gain(&self) -> f32 {
        self.internal_gain
    }

    /// Listener from the last commit.
    pub const fn committed_listener(&self) -> Option<&Listener> {
        self.committed.as_ref()
    }

    /// Number of deferred-change commits.
    pub const fn commit_count(&self) -> usize {
        self.commits
    }

    /// Number of frames ticked.
    pub const fn tick_count(&self) -> usize {
        self.ticks
    }

    /// Number of channels handed out.
    pub const fn channels_created(&self) -> usize {
        self.channels_created
    }
}

impl AudioBackend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Channel = HeadlessChannel;

    fn driver_name(&self, verbose: bool) -> String {
        if verbose {
            format!("Headless (simulated, {} channels created)", self.channels_created)
        } else {
            "Headless".to_string()
        }
    }

    fn create_buffer(&mut self) -> HeadlessBuffer {
        HeadlessBuffer::default()
    }

    fn create_channel(&mut self) -> AudioResult<HeadlessChannel> {
        self.channels_created += 1;
        Ok(HeadlessChannel::new(Arc::clone(&self.clock)))
    }

    fn set_internal_gain(&mut self, gain: f32) {
        self.internal_gain = gain;
    }

    fn commit_deferred_changes(&mut self, listener: &Listener) {
        self.committed = Some(*listener);
        self.commits += 1;
    }

    fn tick(&mut self) {
        self.ticks += 1;
    }
}

/// Buffer that just remembers what was loaded.
#[derive(Debug, Clone, Default)]
pub struct HeadlessBuffer {
    asset: Option<AssetKey>,
    sound: Option<Arc<DecodedSound>>,
}

impl HeadlessBuffer {
    /// Asset loaded into the buffer.
    pub const fn asset(&self) -> Option<AssetKey> {
        self.asset
    }
}

impl BackendBuffer for HeadlessBuffer {
    fn load(&mut self, key: AssetKey, sound: &Arc<DecodedSound>) -> AudioResult<()> {
        self.asset = None;
        self.sound = None;
        if sound.frame_count() == 0 || sound.sample_rate == 0 {
            return Err(AudioError::BufferLoad {
                key,
                message: "empty sound".to_string(),
            });
        }
        self.asset = Some(key);
        self.sound = Some(Arc::clone(sound));
        Ok(())
    }

    fn duration(&self) -> Duration {
        self.sound.as_ref().map_or(Duration::ZERO, |sound| sound.duration())
    }
}

/// Voice whose playback state is derived from the clock.
pub struct HeadlessChannel {
    clock: Arc<dyn Clock>,
    attached: Option<AssetKey>,
    duration: Duration,
    looping: bool,
    started_at: Option<Duration>,
    start_offset: Duration,
    loops_reported: u64,
    gain: f32,
    emitter: Emitter,
}

impl std::fmt::Debug for HeadlessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessChannel")
            .field("attached", &self.attached)
            .field("duration", &self.duration)
            .field("looping", &self.looping)
            .field("started_at", &self.started_at)
            .field("gain", &self.gain)
            .finish_non_exhaustive()
    }
}

impl HeadlessChannel {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            attached: None,
            duration: Duration::ZERO,
            looping: false,
            started_at: None,
            start_offset: Duration::ZERO,
            loops_reported: 0,
            gain: 1.0,
            emitter: Emitter::Ambient,
        }
    }

    /// Asset of the attached buffer.
    pub const fn attached_asset(&self) -> Option<AssetKey> {
        self.attached
    }

    /// Attached with looping on.
    pub const fn is_looping(&self) -> bool {
        self.looping
    }

    /// Last gain set by the engine.
    pub const fn gain(&self) -> f32 {
        self.gain
    }

    /// Last 3D emitter pushed by the engine.
    pub const fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Stop as if the sound had been cut by the device.
    pub fn force_stop(&mut self) {
        self.started_at = None;
        self.loops_reported = 0;
    }

    fn elapsed(&self) -> Option<Duration> {
        self.started_at
            .map(|start| self.clock.now().saturating_sub(start) + self.start_offset)
    }

    fn start_at(&mut self, offset: Duration) {
        self.started_at = Some(self.clock.now());
        self.start_offset = offset;
        self.loops_reported = 0;
    }
}

impl BackendChannel for HeadlessChannel {
    type Buffer = HeadlessBuffer;

    fn attach(&mut self, buffer: &HeadlessBuffer, looping: bool) -> AudioResult<()> {
        let Some(key) = buffer.asset else {
            return Err(AudioError::ChannelAttach("buffer is empty".to_string()));
        };
        self.cleanup();
        self.attached = Some(key);
        self.duration = buffer.duration();
        self.looping = looping;
        trace!("Attached {key} ({:?}, looping {looping})", self.duration);
        Ok(())
    }

    fn cleanup(&mut self) {
        self.attached = None;
        self.duration = Duration::ZERO;
        self.looping = false;
        self.started_at = None;
        self.loops_reported = 0;
    }

    fn play(&mut self) {
        if self.attached.is_none() || self.is_playing() {
            return;
        }
        self.start_at(Duration::ZERO);
    }

    fn play_synced(&mut self, master_position: Option<Duration>) {
        if self.attached.is_none() {
            return;
        }
        let offset = match master_position {
            Some(position) if !self.duration.is_zero() => {
                Duration::from_nanos((position.as_nanos() % self.duration.as_nanos()) as u64)
            },
            _ => Duration::ZERO,
        };
        self.start_at(offset);
    }

    fn is_playing(&self) -> bool {
        match self.elapsed() {
            None => false,
            Some(_) if self.looping => true,
            Some(elapsed) => elapsed < self.duration,
        }
    }

    fn playback_position(&self) -> Option<Duration> {
        let elapsed = self.elapsed()?;
        if self.duration.is_zero() {
            return Some(Duration::ZERO);
        }
        if self.looping {
            Some(Duration::from_nanos((elapsed.as_nanos() % self.duration.as_nanos()) as u64))
        } else {
            Some(elapsed.min(self.duration))
        }
    }

    fn poll_looped(&mut self) -> bool {
        if !self.looping || self.duration.is_zero() {
            return false;
        }
        let Some(elapsed) = self.elapsed() else {
            return false;
        };
        let loops = (elapsed.as_nanos() / self.duration.as_nanos()) as u64;
        if loops > self.loops_reported {
            self.loops_reported = loops;
            return true;
        }
        false
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    fn update_3d(&mut self, emitter: &Emitter, _listener: &Listener) {
        self.emitter = *emitter;
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    remote: AHashMap<AssetKey, DecodedSound>,
    local: AHashMap<AssetKey, DecodedSound>,
    decoded: AHashMap<AssetKey, Arc<DecodedSound>>,
    corrupt: AHashSet<AssetKey>,
    fetch_requests: Vec<AssetKey>,
}

/// Shared in-memory asset storage.
///
/// "Remote" assets can be fetched, "local" assets can be decoded, and
/// "decoded" assets are ready to load. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssetStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryAssetStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `key` available for fetching.
    pub fn insert_remote(&self, key: AssetKey, sound: DecodedSound) {
        self.inner.lock().remote.insert(key, sound);
    }

    /// Put encoded bytes for `key` on local storage.
    pub fn insert_local(&self, key: AssetKey, sound: DecodedSound) {
        self.inner.lock().local.insert(key, sound);
    }

    /// Store `key` as local and already decoded.
    pub fn insert_decoded(&self, key: AssetKey, sound: DecodedSound) {
        let mut inner = self.inner.lock();
        inner.decoded.insert(key, Arc::new(sound.clone()));
        inner.local.insert(key, sound);
    }

    /// Local bytes for `key` that will fail to decode.
    pub fn insert_corrupt_local(&self, key: AssetKey) {
        let mut inner = self.inner.lock();
        inner.local.insert(key, DecodedSound::new(Vec::new(), 0, 0));
        inner.corrupt.insert(key);
    }

    /// Drop local bytes for `key`, as if the cache was purged.
    pub fn evict_local(&self, key: AssetKey) {
        self.inner.lock().local.remove(&key);
    }

    /// Encoded bytes are local.
    pub fn is_local(&self, key: AssetKey) -> bool {
        self.inner.lock().local.contains_key(&key)
    }

    /// Decoded data exists.
    pub fn is_decoded(&self, key: AssetKey) -> bool {
        self.inner.lock().decoded.contains_key(&key)
    }

    /// Every fetch requested so far, in order.
    pub fn fetch_requests(&self) -> Vec<AssetKey> {
        self.inner.lock().fetch_requests.clone()
    }

    /// Fetcher over this store.
    pub fn fetcher(&self) -> MemoryFetcher {
        MemoryFetcher {
            store: self.clone(),
            pending: Vec::new(),
        }
    }

    /// Decoder over this store.
    pub fn decoder(&self) -> MemoryDecoder {
        MemoryDecoder {
            store: self.clone(),
            queue: DecodeQueue::new(),
        }
    }
}

/// Fetcher that copies remote entries to local storage.
///
/// Completions are reported on the poll after the request.
#[derive(Debug)]
pub struct MemoryFetcher {
    store: MemoryAssetStore,
    pending: Vec<AssetKey>,
}

impl AssetFetcher for MemoryFetcher {
    fn has_local_bytes(&self, key: AssetKey) -> bool {
        self.store.is_local(key)
    }

    fn request_fetch(&mut self, key: AssetKey) {
        self.store.inner.lock().fetch_requests.push(key);
        self.pending.push(key);
    }

    fn poll_completions(&mut self) -> Vec<FetchCompletion> {
        let mut inner = self.store.inner.lock();
        self.pending
            .drain(..)
            .map(|key| match inner.remote.get(&key).cloned() {
                Some(sound) => {
                    inner.local.insert(key, sound);
                    FetchCompletion::succeeded(key)
                },
                None => {
                    debug!("Asset {key} not in remote store");
                    FetchCompletion::failed(key)
                },
            })
            .collect()
    }
}

/// Decoder that moves local entries to the decoded map.
#[derive(Debug)]
pub struct MemoryDecoder {
    store: MemoryAssetStore,
    queue: DecodeQueue,
}

impl MemoryDecoder {
    /// Pending decode jobs.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Decoder for MemoryDecoder {
    fn request_decode(&mut self, key: AssetKey) -> bool {
        let inner = self.store.inner.lock();
        if !inner.decoded.contains_key(&key) && !inner.local.contains_key(&key) {
            return false;
        }
        drop(inner);
        self.queue.push(key);
        true
    }

    fn process_queue(&mut self, budget: Duration) -> Vec<DecodeEvent> {
        let store = &self.store;
        self.queue.run(budget, |key| {
            let mut inner = store.inner.lock();
            if inner.decoded.contains_key(&key) {
                return DecodeEvent::Decoded(key);
            }
            if inner.corrupt.contains(&key) {
                return DecodeEvent::Failed(key);
            }
            match inner.local.get(&key).cloned() {
                Some(sound) => {
                    inner.decoded.insert(key, Arc::new(sound));
                    DecodeEvent::Decoded(key)
                },
                None => DecodeEvent::Failed(key),
            }
        })
    }

    fn has_decoded(&self, key: AssetKey) -> bool {
        self.store.is_decoded(key)
    }

    fn decoded(&self, key: AssetKey) -> Option<Arc<DecodedSound>> {
        self.store.inner.lock().decoded.get(&key).cloned()
    }
}
