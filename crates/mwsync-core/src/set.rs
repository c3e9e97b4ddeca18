//! Local edit buffer for set-valued registries.
//!
//! While a registry cannot yet trust its confirmed state (the broker may
//! still be replaying retained messages), additions and removals are held
//! here. Removals are kept as tombstones so that an id removed while offline
//! is also removed from the confirmed set on merge, not only from the buffer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Buffered adds and removes waiting to be merged into a confirmed set.
///
/// For any id at most one of `added` / `removed` holds it; the later call
/// wins, so replaying `add(x); remove(x)` leaves a tombstone for `x`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBuffer {
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl SetBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an addition.
    pub fn add(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.removed.remove(&id);
        self.added.insert(id);
    }

    /// Record a removal.
    pub fn remove(&mut self, id: &str) {
        self.added.remove(id);
        self.removed.insert(id.to_string());
    }

    /// Whether there is nothing to merge.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Pending additions.
    pub fn added(&self) -> impl Iterator<Item = &str> {
        self.added.iter().map(String::as_str)
    }

    /// Pending removals.
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.removed.iter().map(String::as_str)
    }

    /// Merge into `target` and clear the buffer.
    ///
    /// Computes `(target ∪ added) \ removed`. Returns `true` if `target`
    /// changed.
    pub fn drain_into(&mut self, target: &mut BTreeSet<String>) -> bool {
        let mut changed = false;

        for id in std::mem::take(&mut self.added) {
            changed |= target.insert(id);
        }
        for id in std::mem::take(&mut self.removed) {
            changed |= target.remove(&id);
        }

        if changed {
            tracing::debug!(len = target.len(), "Merged buffered set edits");
        }
        changed
    }
}
