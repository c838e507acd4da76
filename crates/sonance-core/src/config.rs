//! Engine configuration.
//!
//! Every tunable the scheduler uses lives here. Configuration can be loaded
//! from and saved to a TOML file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonance_common::{AudioError, AudioResult};
use tracing::info;

/// Hard upper bound on the channel pool size.
pub const MAX_CHANNELS: usize = 30;

/// Hard upper bound on the buffer pool size. A few more than channels so
/// preloaded sounds can stay resident.
pub const MAX_BUFFERS: usize = 40;

/// Decode budget used when `idle` is called with a non-positive budget.
pub const DEFAULT_DECODE_BUDGET_SECS: f32 = 0.002;

/// Unused buffers older than this are released.
pub const BUFFER_STALE_SECS: f32 = 30.0;

/// Sources that never got (or no longer have) playback are reaped after this.
pub const UNPLAYED_TIMEOUT_SECS: f32 = 15.0;

/// Non-looped sources are cut off after this even while playing.
pub const MAX_SOURCE_AGE_SECS: f32 = 60.0;

fn secs_or(secs: f32, fallback: f32) -> Duration {
    Duration::try_from_secs_f32(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f32(fallback))
}

/// Audio engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Number of mixer channels in the pool.
    pub max_channels: usize,
    /// Number of decoded-PCM buffers in the pool.
    pub max_buffers: usize,
    /// Decode budget (seconds) when the caller passes none.
    pub default_decode_budget_secs: f32,
    /// Idle time (seconds) after which an unused buffer is reclaimed.
    pub buffer_stale_secs: f32,
    /// Age (seconds) after which an unplayed or stopped source is reaped.
    pub unplayed_timeout_secs: f32,
    /// Age (seconds) after which a playing non-looped source is reaped.
    pub max_source_age_secs: f32,
    /// Initial master gain (0.0 - 1.0).
    pub master_gain: f32,
    /// Initial doppler factor.
    pub doppler_factor: f32,
    /// Initial distance factor (world units to meters).
    pub distance_factor: f32,
    /// Initial rolloff factor.
    pub rolloff_factor: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            max_channels: MAX_CHANNELS,
            max_buffers: MAX_BUFFERS,
            default_decode_budget_secs: DEFAULT_DECODE_BUDGET_SECS,
            buffer_stale_secs: BUFFER_STALE_SECS,
            unplayed_timeout_secs: UNPLAYED_TIMEOUT_SECS,
            max_source_age_secs: MAX_SOURCE_AGE_SECS,
            master_gain: 1.0,
            doppler_factor: 1.0,
            distance_factor: 1.0,
            rolloff_factor: 1.0,
        }
    }
}

impl AudioConfig {
    /// Create config with a channel pool size.
    #[must_use]
    pub const fn with_max_channels(mut self, channels: usize) -> Self {
        self.max_channels = channels;
        self
    }

    /// Create config with a buffer pool size.
    #[must_use]
    pub const fn with_max_buffers(mut self, buffers: usize) -> Self {
        self.max_buffers = buffers;
        self
    }

    /// Create config with a master gain.
    #[must_use]
    pub const fn with_master_gain(mut self, gain: f32) -> Self {
        self.master_gain = gain;
        self
    }

    /// Create config with a buffer staleness threshold.
    #[must_use]
    pub const fn with_buffer_stale_secs(mut self, secs: f32) -> Self {
        self.buffer_stale_secs = secs;
        self
    }

    /// Check pool sizes and timeouts.
    pub fn validate(&self) -> AudioResult<()> {
        if self.max_channels == 0 || self.max_channels > MAX_CHANNELS {
            return Err(AudioError::InvalidChannelCount {
                requested: self.max_channels,
                max: MAX_CHANNELS,
            });
        }
        if self.max_buffers == 0 || self.max_buffers > MAX_BUFFERS {
            return Err(AudioError::InvalidBufferCount {
                requested: self.max_buffers,
                max: MAX_BUFFERS,
            });
        }
        let timeouts = [
            ("default_decode_budget_secs", self.default_decode_budget_secs),
            ("buffer_stale_secs", self.buffer_stale_secs),
            ("unplayed_timeout_secs", self.unplayed_timeout_secs),
            ("max_source_age_secs", self.max_source_age_secs),
        ];
        for (name, value) in timeouts {
            if !value.is_finite() || value <= 0.0 {
                return Err(AudioError::Config(format!("{name} must be positive, got {value}")));
            }
            if Duration::try_from_secs_f32(value).is_err() {
                return Err(AudioError::Config(format!("{name} is out of range, got {value}")));
            }
        }
        Ok(())
    }

    /// Decode budget used when the caller passes a non-positive one.
    ///
    /// Falls back to [`DEFAULT_DECODE_BUDGET_SECS`] if the field no longer
    /// holds a valid duration.
    #[must_use]
    pub fn default_decode_budget(&self) -> Duration {
        secs_or(self.default_decode_budget_secs, DEFAULT_DECODE_BUDGET_SECS)
    }

    /// Buffer staleness threshold.
    #[must_use]
    pub fn buffer_stale(&self) -> Duration {
        secs_or(self.buffer_stale_secs, BUFFER_STALE_SECS)
    }

    /// Load configuration from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AudioResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| AudioError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        info!("Loaded audio config from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> AudioResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents =
            toml::to_string_pretty(self).map_err(|e| AudioError::Config(e.to_string()))?;
        fs::write(path, contents)?;

        info!("Saved audio config to {}", path.display());
        Ok(())
    }
}
