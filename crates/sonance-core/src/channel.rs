//! Channel pool slots.

use sonance_common::SourceId;

use crate::backend::BackendChannel;

/// One allocated slot of the channel pool.
///
/// `source` and `buffer` are non-owning links; the engine keeps them
/// consistent with the source table and buffer pool.
#[derive(Debug)]
pub struct ChannelSlot<C> {
    pub(crate) channel: C,
    pub(crate) source: Option<SourceId>,
    pub(crate) buffer: Option<usize>,
    pub(crate) waiting_for_sync: bool,
    pub(crate) looped_this_frame: bool,
    pub(crate) secondary_gain: f32,
}

impl<C: BackendChannel> ChannelSlot<C> {
    pub(crate) const fn new(channel: C) -> Self {
        Self {
            channel,
            source: None,
            buffer: None,
            waiting_for_sync: false,
            looped_this_frame: false,
            secondary_gain: 1.0,
        }
    }

    /// Backend channel.
    pub const fn backend(&self) -> &C {
        &self.channel
    }

    /// Bound source.
    pub const fn source(&self) -> Option<SourceId> {
        self.source
    }

    /// Bound buffer pool index.
    pub const fn buffer(&self) -> Option<usize> {
        self.buffer
    }

    /// Held back until a sync master loops.
    pub const fn is_waiting(&self) -> bool {
        self.waiting_for_sync
    }

    /// A loop boundary was observed this frame.
    pub const fn looped_this_frame(&self) -> bool {
        self.looped_this_frame
    }

    /// Per-type gain applied on top of the source gain.
    pub const fn secondary_gain(&self) -> f32 {
        self.secondary_gain
    }

    /// Whether the backend is audibly playing.
    pub fn is_playing(&self) -> bool {
        self.channel.is_playing()
    }

    /// Free for reuse without preempting anyone.
    pub(crate) fn is_idle(&self) -> bool {
        !self.channel.is_playing() && !self.waiting_for_sync
    }

    /// Stop playback and drop both links. Returns the previous source.
    pub(crate) fn release(&mut self) -> Option<SourceId> {
        self.channel.cleanup();
        self.buffer = None;
        self.waiting_for_sync = false;
        self.looped_this_frame = false;
        self.source.take()
    }
}
