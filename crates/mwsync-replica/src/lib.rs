//! # MixedWorld Sync Replica
//!
//! Replicated state on top of one shared broker connection.
//!
//! ## Pieces
//!
//! - [`ConnectionManager`]: owns the transport, runs the reconnect state
//!   machine, multiplexes subscriptions and pumps inbound messages.
//! - [`ReplicatedProperty`]: typed value mirrored to one topic with echo
//!   suppression and a retained-replay handshake.
//! - [`SetRegistry`]: replicated id sets that buffer offline edits and merge
//!   them once the connection is confirmed.
//! - [`Heartbeat`], [`Endpoint`], [`ComponentFactories`]: building blocks for
//!   consumers.
//!
//! Everything here is single-threaded and driven by a scheduler calling
//! `tick` / `update` with the current [`Instant`](std::time::Instant).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod components;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod property;
pub mod registry;
pub mod subscriptions;

pub use components::{ComponentFactories, Materialised};
pub use endpoint::Endpoint;
pub use error::SyncError;
pub use heartbeat::{Beat, Heartbeat, HeartbeatEvent};
pub use manager::{
    ConnectionEvent, ConnectionManager, ConnectionPhase, ConnectionSettings, ListenerId, SubscriptionHandle,
};
pub use property::{PropertyOptions, ReplicatedProperty};
pub use registry::SetRegistry;
pub use subscriptions::{CallbackId, SubscriptionIndex};
