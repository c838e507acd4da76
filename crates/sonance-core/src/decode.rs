//! Decoder collaborator.
//!
//! Decoders turn locally available encoded bytes into [`DecodedSound`]s.
//! The engine asks for decodes and pumps the queue once per frame with a
//! time budget; results come back as [`DecodeEvent`]s from that pump.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sonance_common::AssetKey;

use crate::backend::DecodedSound;

/// Outcome of one decode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeEvent {
    /// Decoded data is now available.
    Decoded(AssetKey),
    /// The asset could not be decoded. It will not be retried.
    Failed(AssetKey),
}

impl DecodeEvent {
    /// Asset this event is about.
    #[must_use]
    pub const fn key(&self) -> AssetKey {
        match self {
            Self::Decoded(key) | Self::Failed(key) => *key,
        }
    }
}

/// Turns local encoded bytes into decoded PCM.
pub trait Decoder {
    /// Queue a decode.
    ///
    /// Returns true if the asset is already decoded or was accepted into the
    /// queue, false if there are no local bytes to decode from.
    fn request_decode(&mut self, key: AssetKey) -> bool;

    /// Run queued work for at most roughly `budget`.
    fn process_queue(&mut self, budget: Duration) -> Vec<DecodeEvent>;

    /// Decoded data exists for `key`.
    fn has_decoded(&self, key: AssetKey) -> bool;

    /// Decoded data for `key`.
    fn decoded(&self, key: AssetKey) -> Option<Arc<DecodedSound>>;
}

/// FIFO of pending decode jobs with cooperative time slicing.
#[derive(Debug, Default)]
pub struct DecodeQueue {
    pending: VecDeque<AssetKey>,
}

impl DecodeQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job. Duplicates are ignored.
    pub fn push(&mut self, key: AssetKey) {
        if !self.pending.contains(&key) {
            self.pending.push_back(key);
        }
    }

    /// Whether a job for `key` is pending.
    #[must_use]
    pub fn contains(&self, key: AssetKey) -> bool {
        self.pending.contains(&key)
    }

    /// Number of pending jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run jobs in order until the queue is empty or `budget` has elapsed.
    ///
    /// At least one job runs per call so a tiny budget still makes progress.
    pub fn run<F>(&mut self, budget: Duration, mut decode: F) -> Vec<DecodeEvent>
    where
        F: FnMut(AssetKey) -> DecodeEvent,
    {
        let start = Instant::now();
        let mut events = Vec::new();
        while let Some(key) = self.pending.pop_front() {
            events.push(decode(key));
            if start.elapsed() >= budget {
                break;
            }
        }
        events
    }
}
