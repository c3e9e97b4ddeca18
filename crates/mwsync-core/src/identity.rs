//! Compact peer identifiers.
//!
//! A peer announces itself with a random UUID client id, but every wire
//! message carries the 32-bit [`NameHash32`] of that id instead. The hash is
//! deterministic across platforms so peers can compare ids they did not
//! create themselves.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Multiplier folding the second lane into the final hash.
const LANE_MIX: u32 = 1_566_083_941;

/// Seed of both hash lanes.
const LANE_SEED: u32 = 5381;

/// A string identifier compressed into a 32-bit hash.
///
/// Formatted as eight upper-case hex digits (`377B546F`), which is also the
/// form used in envelopes and the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NameHash32(u32);

impl NameHash32 {
    /// The hash of the empty string.
    pub const EMPTY: Self = Self(0);

    /// Hash a name.
    ///
    /// Two interleaved DJB lanes over the UTF-16 code units of `name`. Do not
    /// change: peers built from other code bases compare these values.
    #[must_use]
    pub fn new(name: &str) -> Self {
        if name.is_empty() {
            return Self::EMPTY;
        }

        let units: Vec<u16> = name.encode_utf16().collect();
        let mut first = LANE_SEED;
        let mut second = LANE_SEED;

        for pair in units.chunks(2) {
            first = (first << 5).wrapping_add(first) ^ u32::from(pair[0]);
            if let Some(&next) = pair.get(1) {
                second = (second << 5).wrapping_add(second) ^ u32::from(next);
            }
        }

        Self(first.wrapping_add(second.wrapping_mul(LANE_MIX)))
    }

    /// Hash a UUID client id in its hyphenated lower-case form.
    #[must_use]
    pub fn from_client_id(client_id: Uuid) -> Self {
        Self::new(&client_id.hyphenated().to_string())
    }

    /// Wrap a raw hash value.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// The raw hash value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NameHash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for NameHash32 {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 {
            return Err(IdentityError::InvalidHash(s.to_string()));
        }
        u32::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| IdentityError::InvalidHash(s.to_string()))
    }
}

/// Errors that can occur parsing identifiers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    /// Not eight hex digits
    #[error("invalid name hash: {0}")]
    InvalidHash(String),
}
