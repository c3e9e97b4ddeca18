//! Topic scheme for replicated properties.
//!
//! Topic structure: `{mainTopic}/{rootId}/{objectId}/{className}/{propertyName}`
//!
//! - An empty root (or object) id collapses, so `("", "GLOBAL")` yields a
//!   single `GLOBAL` segment.
//! - The global broker prefix is not part of the scheme; the connection
//!   manager applies it to every topic on the wire.

use serde::{Deserialize, Serialize};

/// Reserved channel for the connection-established handshake.
pub const ECHO_TOPIC: &str = "Echo/Test";

/// Default main topic.
pub const DEFAULT_MAIN_TOPIC: &str = "Main/SharedProperty";

/// Object id used by process-wide registries.
pub const GLOBAL_OBJECT: &str = "GLOBAL";

/// Identifies one replicated property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyAddress {
    /// Owning peer, or empty for shared objects
    pub root: String,
    /// Object the property belongs to
    pub object: String,
    /// Kind of the owning behaviour
    pub class: String,
    /// Property name
    pub property: String,
}

impl PropertyAddress {
    /// Create a new address.
    #[must_use]
    pub fn new(
        root: impl Into<String>,
        object: impl Into<String>,
        class: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            object: object.into(),
            class: class.into(),
            property: property.into(),
        }
    }

    /// `root/object` with empty parts collapsed.
    #[must_use]
    pub fn object_path(&self) -> String {
        match (self.root.is_empty(), self.object.is_empty()) {
            (true, _) => self.object.clone(),
            (false, true) => self.root.clone(),
            (false, false) => format!("{}/{}", self.root, self.object),
        }
    }
}

/// Topic scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Leading segments shared by all property topics
    pub main: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new(DEFAULT_MAIN_TOPIC)
    }
}

impl TopicScheme {
    /// Create a new scheme under the given main topic.
    #[must_use]
    pub fn new(main: impl Into<String>) -> Self {
        Self {
            main: main.into().trim_end_matches('/').to_string(),
        }
    }

    fn join(&self, rest: &str) -> String {
        if self.main.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{}", self.main, rest)
        }
    }

    /// Topic for a replicated property.
    #[must_use]
    pub fn property(&self, address: &PropertyAddress) -> String {
        self.join(&format!(
            "{}/{}/{}",
            address.object_path(),
            address.class,
            address.property
        ))
    }

    /// Wildcard covering every property of an object, used for liveness.
    #[must_use]
    pub fn object_wildcard(&self, object: &str) -> String {
        self.join(&format!("{object}/#"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_generation() {
        let scheme = TopicScheme::default();
        let address = PropertyAddress::new("1A4B6F2C", "cube-7", "SharedTransform", "pose");

        assert_eq!(
            scheme.property(&address),
            "Main/SharedProperty/1A4B6F2C/cube-7/SharedTransform/pose"
        );
    }

    #[test]
    fn empty_root_collapses() {
        let scheme = TopicScheme::default();
        let address = PropertyAddress::new("", GLOBAL_OBJECT, "PeerRegistry", "peerIds");

        assert_eq!(
            scheme.property(&address),
            "Main/SharedProperty/GLOBAL/PeerRegistry/peerIds"
        );
    }

    #[test]
    fn empty_object_collapses() {
        let address = PropertyAddress::new("1A4B6F2C", "", "SharedObjectRegistry", "objectIds");
        assert_eq!(address.object_path(), "1A4B6F2C");
    }

    #[test]
    fn wildcard_topics() {
        let scheme = TopicScheme::new("Main/SharedProperty/");

        assert_eq!(scheme.object_wildcard("cube-7"), "Main/SharedProperty/cube-7/#");
        assert_eq!(TopicScheme::new("").object_wildcard("cube-7"), "cube-7/#");
    }
}
