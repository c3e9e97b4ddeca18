//! Set reconciliation.
//!
//! Registries converge by union: whatever any peer has announced stays in the
//! set until some peer explicitly removes it. Consumers materialise one local
//! representation per entry and use [`SetDiff`] to find what to create and
//! what to destroy after each change.

use std::collections::BTreeSet;

/// Difference between a desired set and what is currently materialised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDiff {
    /// In the desired set but not yet materialised
    pub added: Vec<String>,
    /// Materialised but no longer desired
    pub removed: Vec<String>,
}

impl SetDiff {
    /// Compute the diff between `desired` and `materialised`.
    ///
    /// Both lists come out sorted.
    #[must_use]
    pub fn between<'a, D, M>(desired: D, materialised: M) -> Self
    where
        D: IntoIterator<Item = &'a String>,
        M: IntoIterator<Item = &'a String>,
    {
        let desired: BTreeSet<&String> = desired.into_iter().collect();
        let materialised: BTreeSet<&String> = materialised.into_iter().collect();

        Self {
            added: desired
                .difference(&materialised)
                .map(|s| (*s).clone())
                .collect(),
            removed: materialised
                .difference(&desired)
                .map(|s| (*s).clone())
                .collect(),
        }
    }

    /// Whether nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
