//! Logical sound emitters.
//!
//! An [`AudioSource`] is what callers create and position. It never touches
//! backend objects itself; the engine binds it to a pooled channel when its
//! priority earns one.

use std::collections::BTreeSet;
use std::time::Duration;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use sonance_common::{AssetKey, OwnerId, SourceId};

/// Sound category, indexing the engine's secondary gain table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SoundType {
    /// Uncategorized.
    #[default]
    None = 0,
    /// World sound effects.
    Sfx = 1,
    /// Interface sounds.
    Ui = 2,
    /// Environmental background audio.
    Ambient = 3,
}

impl SoundType {
    /// Number of sound types.
    pub const COUNT: usize = 4;

    /// All sound types in table order.
    pub const ALL: [Self; Self::COUNT] = [Self::None, Self::Sfx, Self::Ui, Self::Ambient];

    /// Convert from the raw integer category.
    #[must_use]
    pub const fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Sfx),
            2 => Some(Self::Ui),
            3 => Some(Self::Ambient),
            _ => None,
        }
    }

    /// Index into the secondary gain table.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Get a human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sfx => "SFX",
            Self::Ui => "UI",
            Self::Ambient => "Ambient",
        }
    }
}

/// Explicit scheduling state of a live source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceState {
    /// No channel and no playable buffer yet.
    Unbound,
    /// Buffer ready, waiting to win a channel.
    PendingChannel,
    /// Bound to a channel that is playing.
    Playing,
    /// Bound to a channel that is not playing.
    Stalled,
}

/// A logical sound emitter.
#[derive(Debug, Clone)]
pub struct AudioSource {
    id: SourceId,
    owner: OwnerId,
    sound_type: SoundType,
    gain: f32,
    ambient: bool,
    position: Vec3,
    velocity: Vec3,
    looping: bool,
    sync_master: bool,
    sync_slave: bool,
    queue_sounds: bool,
    pub(crate) played_once: bool,
    priority: f32,
    pub(crate) age_origin: Duration,
    pub(crate) current: Option<AssetKey>,
    pub(crate) queued: Option<AssetKey>,
    pub(crate) preloads: BTreeSet<AssetKey>,
    pub(crate) channel: Option<usize>,
}

/// Clamp to 0.0 - 1.0; NaN becomes silent.
fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        0.0
    } else {
        gain.clamp(0.0, 1.0)
    }
}

impl AudioSource {
    /// Create a positioned source at the origin with a fresh id.
    #[must_use]
    pub fn new(owner: OwnerId, gain: f32, sound_type: SoundType) -> Self {
        Self::with_id(SourceId::new(), owner, gain, sound_type)
    }

    /// Create a source with a caller-chosen id.
    #[must_use]
    pub fn with_id(id: SourceId, owner: OwnerId, gain: f32, sound_type: SoundType) -> Self {
        Self {
            id,
            owner,
            sound_type,
            gain: clamp_gain(gain),
            ambient: false,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            looping: false,
            sync_master: false,
            sync_slave: false,
            queue_sounds: false,
            played_once: false,
            priority: 0.0,
            age_origin: Duration::ZERO,
            current: None,
            queued: None,
            preloads: BTreeSet::new(),
            channel: None,
        }
    }

    /// Create with a world position.
    #[must_use]
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.set_position(position);
        self
    }

    /// Create as an ambient source.
    #[must_use]
    pub const fn ambient(mut self) -> Self {
        self.ambient = true;
        self
    }

    /// Create with looping enabled/disabled.
    #[must_use]
    pub const fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Create with sound queueing enabled/disabled.
    #[must_use]
    pub const fn with_queue_sounds(mut self, queue: bool) -> Self {
        self.queue_sounds = queue;
        self
    }

    /// Create as a loop sync master.
    #[must_use]
    pub const fn with_sync_master(mut self, master: bool) -> Self {
        self.sync_master = master;
        self
    }

    /// Create as a loop sync slave.
    #[must_use]
    pub const fn with_sync_slave(mut self, slave: bool) -> Self {
        self.sync_slave = slave;
        self
    }

    /// Source id.
    #[must_use]
    pub const fn id(&self) -> SourceId {
        self.id
    }

    /// Agent responsible for the sound.
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Sound category.
    #[must_use]
    pub const fn sound_type(&self) -> SoundType {
        self.sound_type
    }

    /// Gain (0.0 - 1.0).
    #[must_use]
    pub const fn gain(&self) -> f32 {
        self.gain
    }

    /// Set gain, clamped to 0.0 - 1.0.
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = clamp_gain(gain);
    }

    /// Exempt from distance falloff.
    #[must_use]
    pub const fn is_ambient(&self) -> bool {
        self.ambient
    }

    /// Set the ambient flag.
    pub fn set_ambient(&mut self, ambient: bool) {
        self.ambient = ambient;
    }

    /// World position.
    #[must_use]
    pub const fn position(&self) -> Vec3 {
        self.position
    }

    /// Set the world position.
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Velocity.
    #[must_use]
    pub const fn velocity(&self) -> Vec3 {
        self.velocity
    }

    /// Set the velocity.
    pub fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity;
    }

    /// Loops its current sound.
    #[must_use]
    pub const fn is_loop(&self) -> bool {
        self.looping
    }

    /// Set the loop flag. Takes effect the next time a buffer is attached.
    pub fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Leader for loop synchronization.
    #[must_use]
    pub const fn is_sync_master(&self) -> bool {
        self.sync_master
    }

    /// Set the sync master flag.
    pub fn set_sync_master(&mut self, master: bool) {
        self.sync_master = master;
    }

    /// Starts only in phase with the sync master.
    #[must_use]
    pub const fn is_sync_slave(&self) -> bool {
        self.sync_slave
    }

    /// Set the sync slave flag.
    pub fn set_sync_slave(&mut self, slave: bool) {
        self.sync_slave = slave;
    }

    /// New play requests queue behind the current sound.
    #[must_use]
    pub const fn queues_sounds(&self) -> bool {
        self.queue_sounds
    }

    /// Set the queue-sounds flag.
    pub fn set_queue_sounds(&mut self, queue: bool) {
        self.queue_sounds = queue;
    }

    /// A channel has started playing this source at least once.
    #[must_use]
    pub const fn played_once(&self) -> bool {
        self.played_once
    }

    /// Priority computed on the last update.
    #[must_use]
    pub const fn priority(&self) -> f32 {
        self.priority
    }

    /// Asset currently playing or about to play.
    #[must_use]
    pub const fn current_asset(&self) -> Option<AssetKey> {
        self.current
    }

    /// Asset waiting behind the current one.
    #[must_use]
    pub const fn queued_asset(&self) -> Option<AssetKey> {
        self.queued
    }

    /// Assets being prefetched for this source.
    pub fn preloads(&self) -> impl Iterator<Item = AssetKey> + '_ {
        self.preloads.iter().copied()
    }

    /// Channel pool index this source is bound to.
    #[must_use]
    pub const fn channel(&self) -> Option<usize> {
        self.channel
    }

    /// Priority relative to a listener position.
    ///
    /// Ambient sources always get `f32::MAX`. Everything else falls off with
    /// the inverse square of distance, floored at one unit.
    #[must_use]
    pub fn compute_priority(&self, listener: Vec3) -> f32 {
        if self.ambient {
            return f32::MAX;
        }
        let dist_squared = self.position.distance_squared(listener);
        if dist_squared.is_nan() {
            return 0.0;
        }
        let priority = self.gain / dist_squared.max(1.0);
        if priority.is_finite() {
            priority
        } else {
            0.0
        }
    }

    pub(crate) fn update_priority(&mut self, listener: Vec3) {
        self.priority = self.compute_priority(listener);
    }

    /// Time since the last play request.
    #[must_use]
    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.age_origin)
    }

    pub(crate) fn reset_age(&mut self, now: Duration) {
        self.age_origin = now;
    }

    /// Move the queued asset into the current slot.
    pub(crate) fn promote_queued(&mut self) -> bool {
        match self.queued.take() {
            Some(next) => {
                self.current = Some(next);
                true
            },
            None => false,
        }
    }
}
