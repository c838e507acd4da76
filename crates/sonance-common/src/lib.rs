//! # Sonance Common
//!
//! Common types shared by the Sonance audio crates.
//!
//! This crate provides:
//! - Identifier types (asset keys, source ids, owner ids)
//! - The audio error taxonomy
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod ids;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::*;
    pub use crate::ids::*;
}

pub use prelude::*;
