//! Error types for the Sonance audio engine.
//!
//! Only setup paths (initialization, configuration, backend construction)
//! return these errors to callers. The per-frame scheduling path logs
//! failures and retries on the next frame instead.

use thiserror::Error;

use crate::ids::AssetKey;

/// Audio engine error types.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The engine has not been initialized, or has been shut down.
    #[error("Audio engine not initialized")]
    NotInitialized,

    /// Requested channel pool size is out of range.
    #[error("Invalid channel count {requested} (must be 1..={max})")]
    InvalidChannelCount {
        /// Requested number of channels.
        requested: usize,
        /// Maximum supported number of channels.
        max: usize,
    },

    /// Requested buffer pool size is out of range.
    #[error("Invalid buffer count {requested} (must be 1..={max})")]
    InvalidBufferCount {
        /// Requested number of buffers.
        requested: usize,
        /// Maximum supported number of buffers.
        max: usize,
    },

    /// A backend buffer could not be populated with decoded data.
    #[error("Failed to load buffer for asset {key}: {message}")]
    BufferLoad {
        /// Asset that failed to load.
        key: AssetKey,
        /// Error message.
        message: String,
    },

    /// Decoding an asset failed.
    #[error("Failed to decode asset {key}: {message}")]
    DecodeFailed {
        /// Asset that failed to decode.
        key: AssetKey,
        /// Error message.
        message: String,
    },

    /// A backend channel could not be attached to a buffer.
    #[error("Failed to attach channel: {0}")]
    ChannelAttach(String),

    /// Failed to initialize the output device.
    #[error("Failed to initialize audio device: {0}")]
    DeviceInitFailed(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;
