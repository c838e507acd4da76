//! # Sonance Core
//!
//! Sound-source prioritization and channel allocation.
//!
//! A host registers any number of sound sources and asks them to play
//! assets identified by content keys. The engine multiplexes them onto a
//! small fixed pool of mixing channels and decoded-PCM buffers:
//! - Sources are ranked every frame by gain over squared listener distance
//! - The best channel-less source takes a free, idle or strictly
//!   lower-priority channel
//! - Buffers are kept alive by the channels playing them and swept when
//!   stale; a full pool gives up its least recently used unbound buffer
//! - Queued sounds advance when the current one ends or loops
//! - Sync slaves start in phase with the loudest looping sync master
//! - Missing assets are fetched one at a time, most wanted first, then
//!   decoded under a per-frame time budget
//!
//! ## Backends
//!
//! The engine talks to mixing hardware through the [`AudioBackend`] traits.
//! [`HeadlessBackend`] simulates playback against a clock; the
//! `rodio-backend` feature adds real output through rodio.
//!
//! ## Errors
//!
//! Only setup (construction, `init`, configuration files) returns errors.
//! The per-frame path logs through `tracing` and retries next frame.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod asset;
pub mod backend;
pub mod buffer;
pub mod channel;
pub mod clock;
pub mod config;
pub mod decode;
pub mod engine;
pub mod fetch;
pub mod fs_store;
pub mod headless;
pub mod listener;
#[cfg(feature = "rodio-backend")]
pub mod rodio_backend;
pub mod source;
pub mod stats;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::asset::*;
    pub use crate::backend::*;
    pub use crate::buffer::*;
    pub use crate::channel::*;
    pub use crate::clock::*;
    pub use crate::config::*;
    pub use crate::decode::*;
    pub use crate::engine::*;
    pub use crate::fetch::*;
    pub use crate::fs_store::*;
    pub use crate::headless::*;
    pub use crate::listener::*;
    #[cfg(feature = "rodio-backend")]
    pub use crate::rodio_backend::*;
    pub use crate::source::*;
    pub use crate::stats::*;
    pub use sonance_common::prelude::*;
}

pub use prelude::*;
