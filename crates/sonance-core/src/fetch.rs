//! Asset fetcher collaborator.
//!
//! Brings encoded bytes from a remote store to local storage. The engine
//! keeps at most one fetch in flight and learns about completions either
//! through [`AudioEngine::fetch_completed`](crate::AudioEngine::fetch_completed)
//! or by draining [`AssetFetcher::poll_completions`] once per frame.

use sonance_common::AssetKey;

/// Result of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCompletion {
    /// Asset that was fetched.
    pub key: AssetKey,
    /// Bytes are now local.
    pub success: bool,
}

impl FetchCompletion {
    /// A successful fetch.
    #[must_use]
    pub const fn succeeded(key: AssetKey) -> Self {
        Self { key, success: true }
    }

    /// A failed fetch.
    #[must_use]
    pub const fn failed(key: AssetKey) -> Self {
        Self {
            key,
            success: false,
        }
    }
}

/// Remote-to-local asset transfer.
pub trait AssetFetcher {
    /// Encoded bytes for `key` are on local storage.
    fn has_local_bytes(&self, key: AssetKey) -> bool;

    /// Start bringing `key` to local storage.
    fn request_fetch(&mut self, key: AssetKey);

    /// Completions since the last poll.
    fn poll_completions(&mut self) -> Vec<FetchCompletion> {
        Vec::new()
    }
}
