//! Mixing backend capabilities.
//!
//! The engine owns fixed pools of backend channels and buffers and drives
//! them only through these traits. A backend decides how samples actually
//! reach the speakers; the engine decides which sounds get to use them.

use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use sonance_common::{AssetKey, AudioResult};

use crate::listener::Listener;

/// Decoded PCM ready to be loaded into a backend buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSound {
    /// Interleaved samples in -1.0..=1.0.
    pub samples: Arc<Vec<f32>>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl DecodedSound {
    /// Create decoded sound data.
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_rate,
            channels,
        }
    }

    /// A silent sound of the given length, mostly useful for simulation.
    #[must_use]
    pub fn silence(duration: Duration, sample_rate: u32, channels: u16) -> Self {
        let frames = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
        Self::new(vec![0.0; frames * usize::from(channels)], sample_rate, channels)
    }

    /// Number of sample frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / usize::from(self.channels)
    }

    /// Playback length.
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let frames = self.frame_count() as f64;
        Duration::from_secs_f64(frames / f64::from(self.sample_rate))
    }

    /// Memory used by the sample data.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

/// Where a channel's sound is emitted from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Emitter {
    /// Heard at full level regardless of listener position.
    Ambient,
    /// A point in the world.
    Positioned {
        /// World position.
        position: Vec3,
        /// Velocity for doppler.
        velocity: Vec3,
    },
}

/// A backend-owned slot holding decoded PCM.
pub trait BackendBuffer {
    /// Populate the buffer. On error the buffer must be left empty.
    fn load(&mut self, key: AssetKey, sound: &Arc<DecodedSound>) -> AudioResult<()>;

    /// Length of the loaded sound, zero when empty.
    fn duration(&self) -> Duration;
}

/// A backend-owned mixer voice.
pub trait BackendChannel {
    /// Buffer type this channel can play.
    type Buffer: BackendBuffer;

    /// Bind a buffer. Playback does not start until [`play`](Self::play).
    fn attach(&mut self, buffer: &Self::Buffer, looping: bool) -> AudioResult<()>;

    /// Stop playback and drop the buffer binding.
    fn cleanup(&mut self);

    /// Start playback, or restart it if the bound sound has finished.
    fn play(&mut self);

    /// Start playback aligned to a master channel's position.
    ///
    /// `master_position` is how far into its sound the master is.
    fn play_synced(&mut self, master_position: Option<Duration>);

    /// Whether the channel is audibly playing.
    fn is_playing(&self) -> bool;

    /// Current offset into the bound sound.
    fn playback_position(&self) -> Option<Duration>;

    /// Returns true once for every loop boundary passed since the last call.
    fn poll_looped(&mut self) -> bool;

    /// Set the effective gain for this voice.
    fn set_gain(&mut self, gain: f32);

    /// Push 3D parameters.
    fn update_3d(&mut self, emitter: &Emitter, listener: &Listener);
}

/// A mixing backend: the factory for channels and buffers plus global state.
pub trait AudioBackend {
    /// Buffer type.
    type Buffer: BackendBuffer;
    /// Channel type.
    type Channel: BackendChannel<Buffer = Self::Buffer>;

    /// Human-readable driver name.
    fn driver_name(&self, verbose: bool) -> String;

    /// Create an empty buffer.
    fn create_buffer(&mut self) -> Self::Buffer;

    /// Create a channel.
    fn create_channel(&mut self) -> AudioResult<Self::Channel>;

    /// Apply the master gain (already zeroed when muted).
    fn set_internal_gain(&mut self, gain: f32);

    /// Commit batched listener and global 3D changes.
    fn commit_deferred_changes(&mut self, _listener: &Listener) {}

    /// Backend-specific periodic maintenance.
    fn tick(&mut self) {}
}
