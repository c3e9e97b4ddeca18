//! # MixedWorld Sync Protocol
//!
//! Wire contract shared by every peer.
//!
//! ## Messages
//!
//! - `Message`: a raw publish as delivered by the transport
//! - `LastWill`: message the broker publishes if a peer drops uncleanly
//! - `Envelope`: JSON wrapper around a replicated property value
//!
//! ## Topics
//!
//! Property topic scheme: `{mainTopic}/{rootId}/{objectId}/{className}/{propertyName}`.
//! The connection handshake uses the reserved channel `Echo/Test`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod filter;
pub mod messages;
pub mod topics;

pub use filter::{FilterError, TopicFilter};
pub use messages::{Data, Envelope, LastWill, Message, MessageError, Meta, QoS};
pub use topics::{PropertyAddress, TopicScheme, DEFAULT_MAIN_TOPIC, ECHO_TOPIC, GLOBAL_OBJECT};
