//! Per-asset availability state.

use sonance_common::AssetKey;

/// Identity and availability of one piece of sound data.
///
/// Assets are created on first lookup and live until engine shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAsset {
    key: AssetKey,
    has_local_data: bool,
    has_decoded_data: bool,
    has_valid_data: bool,
    buffer: Option<usize>,
}

impl AudioAsset {
    /// Create an asset with the availability the collaborators report.
    #[must_use]
    pub const fn new(key: AssetKey, has_local_data: bool, has_decoded_data: bool) -> Self {
        Self {
            key,
            has_local_data,
            has_decoded_data,
            has_valid_data: true,
            buffer: None,
        }
    }

    /// Content key.
    #[must_use]
    pub const fn key(&self) -> AssetKey {
        self.key
    }

    /// Encoded bytes are on local storage.
    #[must_use]
    pub const fn has_local_data(&self) -> bool {
        self.has_local_data
    }

    /// A decoded representation exists.
    #[must_use]
    pub const fn has_decoded_data(&self) -> bool {
        self.has_decoded_data
    }

    /// False once a fetch or decode has failed.
    #[must_use]
    pub const fn has_valid_data(&self) -> bool {
        self.has_valid_data
    }

    /// Buffer pool index holding this asset, if loaded.
    #[must_use]
    pub const fn buffer(&self) -> Option<usize> {
        self.buffer
    }

    /// Bytes need fetching and fetching is still allowed.
    #[must_use]
    pub const fn needs_fetch(&self) -> bool {
        !self.has_local_data && self.has_valid_data
    }

    pub(crate) fn set_buffer(&mut self, buffer: Option<usize>) {
        self.buffer = buffer;
    }

    pub(crate) fn mark_fetched(&mut self) {
        self.has_valid_data = true;
        self.has_local_data = true;
    }

    pub(crate) fn mark_fetch_failed(&mut self) {
        self.has_valid_data = false;
        self.has_local_data = false;
        self.has_decoded_data = false;
    }

    pub(crate) fn mark_decoded(&mut self) {
        self.has_decoded_data = true;
        self.has_valid_data = true;
    }

    pub(crate) fn mark_decode_failed(&mut self) {
        self.has_valid_data = false;
        self.has_decoded_data = false;
    }

    /// The decoder no longer holds the decoded data.
    pub(crate) fn mark_decoded_lost(&mut self) {
        self.has_decoded_data = false;
    }

    /// Local bytes have disappeared from storage; fetch again.
    pub(crate) fn mark_local_lost(&mut self) {
        self.has_local_data = false;
    }
}
