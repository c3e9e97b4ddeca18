//! Replicated property status and sharing mode.

use serde::{Deserialize, Serialize};

/// Where a replicated property is in its publish/receive cycle.
///
/// ```text
/// New ──set──▶ Dirty ──flush──▶ Sending ──▶ Sent
///                ▲                             │
///           set  │        inbound accepted     ▼
///                └──────────────────────── Received
/// Refresh: forced re-publish requested by a broadcast
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyStatus {
    /// Created, never flushed or received
    #[default]
    New,
    /// Local value changed since the last flush
    Dirty,
    /// A flush is in progress
    Sending,
    /// The last flush was handed to the transport
    Sent,
    /// The value was last set by an inbound update
    Received,
    /// A broadcast asked every property to re-publish
    Refresh,
}

impl PropertyStatus {
    /// Whether an update call should flush in this state.
    #[must_use]
    pub fn wants_flush(self) -> bool {
        matches!(self, Self::Dirty | Self::Refresh)
    }
}

/// Which directions of replication a property takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SharedMode {
    /// Publishes local changes, never raises change events
    Sender,
    /// Applies inbound updates, never publishes
    Receiver,
    /// Both directions
    #[default]
    Both,
}

impl SharedMode {
    /// Whether flushing is active.
    #[must_use]
    pub fn sends(self) -> bool {
        matches!(self, Self::Sender | Self::Both)
    }

    /// Whether change events are raised for inbound updates.
    #[must_use]
    pub fn receives(self) -> bool {
        matches!(self, Self::Receiver | Self::Both)
    }
}
