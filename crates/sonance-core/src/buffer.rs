//! Buffer pool slots.

use std::time::Duration;

use sonance_common::AssetKey;

/// One occupied slot of the buffer pool.
///
/// Wraps the backend buffer with the usage metadata the engine needs for
/// mark-and-sweep reclamation and LRU takeover.
#[derive(Debug)]
pub struct BufferSlot<B> {
    pub(crate) buffer: B,
    pub(crate) in_use: bool,
    pub(crate) last_used: Duration,
    pub(crate) asset: Option<AssetKey>,
}

impl<B> BufferSlot<B> {
    pub(crate) const fn new(buffer: B, now: Duration) -> Self {
        Self {
            buffer,
            in_use: false,
            last_used: now,
            asset: None,
        }
    }

    /// Backend buffer.
    pub const fn backend(&self) -> &B {
        &self.buffer
    }

    /// Marked in use during the current frame.
    pub const fn in_use(&self) -> bool {
        self.in_use
    }

    /// Clock time of the last keep-alive.
    pub const fn last_used(&self) -> Duration {
        self.last_used
    }

    /// Asset loaded into this buffer.
    pub const fn asset(&self) -> Option<AssetKey> {
        self.asset
    }

    /// Keep-alive from a channel playing this buffer.
    pub(crate) fn touch(&mut self, now: Duration) {
        self.in_use = true;
        self.last_used = now;
    }

    /// Unused and idle for strictly longer than `threshold`.
    pub(crate) fn is_stale(&self, now: Duration, threshold: Duration) -> bool {
        !self.in_use && now.saturating_sub(self.last_used) > threshold
    }
}
