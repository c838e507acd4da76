//! Engine diagnostics snapshot.

use serde::{Deserialize, Serialize};
use sonance_common::AssetKey;

/// Point-in-time counts describing the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Registered sources.
    pub sources: usize,
    /// Known assets.
    pub assets: usize,
    /// Assets with decoded data.
    pub decoded_assets: usize,
    /// Assets poisoned by a failed fetch or decode.
    pub invalid_assets: usize,
    /// Channel slots holding a backend channel.
    pub channels_allocated: usize,
    /// Channels bound to a source.
    pub channels_bound: usize,
    /// Channels audibly playing.
    pub channels_playing: usize,
    /// Buffer slots holding a backend buffer.
    pub buffers_allocated: usize,
    /// Buffers kept alive this frame.
    pub buffers_in_use: usize,
    /// Asset fetch in flight.
    pub current_transfer: Option<AssetKey>,
    /// Global mute.
    pub muted: bool,
    /// Configured master gain.
    pub master_gain: f32,
}

impl EngineStats {
    /// Channels bound but not playing.
    #[must_use]
    pub const fn channels_stalled(&self) -> usize {
        self.channels_bound.saturating_sub(self.channels_playing)
    }
}
