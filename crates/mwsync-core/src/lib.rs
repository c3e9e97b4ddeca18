//! # MixedWorld Sync Core
//!
//! Pure data types shared by every layer of the synchronization stack.
//!
//! This crate provides:
//! - Stable 32-bit peer identifiers derived from client ids
//! - The replicated property status machine and sender/receiver modes
//! - A local edit buffer for set-valued registries (adds + tombstones)
//! - Set diff used by registry consumers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod identity;
pub mod merge;
pub mod set;
pub mod status;

pub use identity::NameHash32;
pub use merge::SetDiff;
pub use set::SetBuffer;
pub use status::{PropertyStatus, SharedMode};
