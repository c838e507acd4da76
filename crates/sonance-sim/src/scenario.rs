//! Scenario files.
//!
//! A scenario is a TOML document with an `[audio]` table for the engine and
//! lists of assets and scheduled sounds:
//!
//! ```toml
//! channels = 4
//! frames = 600
//!
//! [audio]
//! max_buffers = 8
//!
//! [[assets]]
//! name = "footstep"
//! duration_secs = 0.4
//! location = "decoded"
//!
//! [[sounds]]
//! asset = "footstep"
//! frame = 10
//! position = [3.0, 0.0, 0.0]
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sonance_core::{AudioConfig, SoundType};
use tracing::info;

/// Where an asset starts out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetLocation {
    /// Only in the remote store; must be fetched.
    #[default]
    Remote,
    /// Encoded bytes cached locally.
    Local,
    /// Already decoded.
    Decoded,
    /// Local bytes that fail to decode.
    Corrupt,
    /// Nowhere; fetching fails.
    Missing,
}

/// An asset available to the scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSpec {
    /// Name sounds refer to.
    pub name: String,
    /// Playback length.
    #[serde(default = "default_duration")]
    pub duration_secs: f32,
    /// Initial availability.
    #[serde(default)]
    pub location: AssetLocation,
}

fn default_duration() -> f32 {
    1.0
}

fn default_gain() -> f32 {
    1.0
}

fn default_count() -> u32 {
    1
}

/// A sound started at a given frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundSpec {
    /// Asset name.
    pub asset: String,
    /// Frame to start on.
    #[serde(default)]
    pub frame: u32,
    /// Source gain.
    #[serde(default = "default_gain")]
    pub gain: f32,
    /// Sound category.
    #[serde(default)]
    pub sound_type: SoundType,
    /// World position; absent means ambient.
    #[serde(default)]
    pub position: Option<[f32; 3]>,
    /// Random offset radius applied to each axis of `position`.
    #[serde(default)]
    pub scatter: f32,
    /// Number of copies to start.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Loop until the end of the run.
    #[serde(default)]
    pub looping: bool,
    /// Sync master for loop alignment.
    #[serde(default)]
    pub sync_master: bool,
    /// Sync slave waiting on a master's loop.
    #[serde(default)]
    pub sync_slave: bool,
}

/// Complete simulation setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Engine configuration.
    pub audio: AudioConfig,
    /// Channel pool size passed to `init`.
    pub channels: usize,
    /// Number of frames to run.
    pub frames: u32,
    /// Simulated time per frame.
    pub frame_secs: f32,
    /// Decode budget passed to `idle`.
    pub decode_budget_secs: f32,
    /// Seed for position scatter (None = random).
    pub seed: Option<u64>,
    /// Listener position.
    pub listener: [f32; 3],
    /// Assets.
    pub assets: Vec<AssetSpec>,
    /// Scheduled sounds.
    pub sounds: Vec<SoundSpec>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            channels: 8,
            frames: 300,
            frame_secs: 1.0 / 60.0,
            decode_budget_secs: 0.002,
            seed: None,
            listener: [0.0; 3],
            assets: vec![
                AssetSpec {
                    name: "wind".to_string(),
                    duration_secs: 2.0,
                    location: AssetLocation::Decoded,
                },
                AssetSpec {
                    name: "shot".to_string(),
                    duration_secs: 0.5,
                    location: AssetLocation::Remote,
                },
            ],
            sounds: vec![
                SoundSpec {
                    asset: "wind".to_string(),
                    frame: 0,
                    gain: 0.6,
                    sound_type: SoundType::Ambient,
                    position: None,
                    scatter: 0.0,
                    count: 1,
                    looping: true,
                    sync_master: false,
                    sync_slave: false,
                },
                SoundSpec {
                    asset: "shot".to_string(),
                    frame: 30,
                    gain: 1.0,
                    sound_type: SoundType::Sfx,
                    position: Some([10.0, 0.0, 0.0]),
                    scatter: 8.0,
                    count: 12,
                    looping: false,
                    sync_master: false,
                    sync_slave: false,
                },
            ],
        }
    }
}

impl SimConfig {
    /// Load a scenario file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse scenario {}", path.display()))?;
        config.validate()?;
        info!("Loaded scenario from {}", path.display());
        Ok(config)
    }

    /// Check cross references and ranges.
    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        if self.frame_secs <= 0.0 || Duration::try_from_secs_f32(self.frame_secs).is_err() {
            bail!("frame_secs must be a positive duration, got {}", self.frame_secs);
        }
        for asset in &self.assets {
            if Duration::try_from_secs_f32(asset.duration_secs).is_err() {
                bail!("asset '{}' has invalid duration {}", asset.name, asset.duration_secs);
            }
        }
        for sound in &self.sounds {
            if !self.assets.iter().any(|asset| asset.name == sound.asset) {
                bail!("sound refers to unknown asset '{}'", sound.asset);
            }
        }
        Ok(())
    }
}
