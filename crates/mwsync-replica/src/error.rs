//! Errors surfaced to consumers of the sync layer.

use mwsync_proto::{FilterError, MessageError};
use mwsync_transport::TransportError;

/// Errors for connection-manager and property operations.
///
/// Transient connectivity failures never appear here; the manager recovers
/// from them with its reconnect timer. What does appear is caller misuse or
/// an operation that needs a live connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Transport refused the request
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Operation needs a connected manager
    #[error("not connected")]
    NotConnected,
    /// Connection-level setting changed while connected or connecting
    #[error("{0} cannot be changed while connected or connecting")]
    ConfigurationLocked(&'static str),
    /// Flush requested on a receiver-only property
    #[error("receiver-only property cannot publish")]
    ReceiverOnly,
    /// Topic filter did not compile
    #[error(transparent)]
    Filter(#[from] FilterError),
    /// Value could not be encoded
    #[error(transparent)]
    Message(#[from] MessageError),
}
