//! Eventually-consistent string sets.
//!
//! A [`SetRegistry`] is one replicated `BTreeSet<String>` plus a local
//! buffer of edits made before the handshake confirmed retained replay.
//! The buffer is folded into the confirmed set (adds unioned, tombstones
//! removed) as soon as that is safe, so nothing a peer did offline is lost.

use crate::manager::ConnectionManager;
use crate::property::{PropertyOptions, ReplicatedProperty};
use crate::SyncError;
use mwsync_core::{SetBuffer, SharedMode};
use mwsync_proto::{PropertyAddress, TopicScheme, GLOBAL_OBJECT};
use std::collections::BTreeSet;
use std::time::Instant;

/// Set of ids replicated with union merge.
#[derive(Debug)]
pub struct SetRegistry {
    property: ReplicatedProperty<BTreeSet<String>>,
    buffer: SetBuffer,
}

impl SetRegistry {
    /// Declare a registry at `address`.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be registered.
    pub fn new(manager: &mut ConnectionManager, scheme: &TopicScheme, address: PropertyAddress) -> Result<Self, SyncError> {
        let options = PropertyOptions {
            mode: SharedMode::Both,
            allow_echo: true,
            ..PropertyOptions::default()
        };
        let property = ReplicatedProperty::new(manager, scheme, address, BTreeSet::new(), options)?;
        Ok(Self {
            property,
            buffer: SetBuffer::new(),
        })
    }

    /// Known peers, `GLOBAL/PeerRegistry/peerIds`.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be registered.
    pub fn peers(manager: &mut ConnectionManager, scheme: &TopicScheme) -> Result<Self, SyncError> {
        Self::new(
            manager,
            scheme,
            PropertyAddress::new("", GLOBAL_OBJECT, "PeerRegistry", "peerIds"),
        )
    }

    /// Shared objects, `GLOBAL/ObjectRegistry/objectIds`.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be registered.
    pub fn objects(manager: &mut ConnectionManager, scheme: &TopicScheme) -> Result<Self, SyncError> {
        Self::new(
            manager,
            scheme,
            PropertyAddress::new("", GLOBAL_OBJECT, "ObjectRegistry", "objectIds"),
        )
    }

    /// Objects owned by `peer`, `{peer}/SharedObjectRegistry/objectIds`.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be registered.
    pub fn children(manager: &mut ConnectionManager, scheme: &TopicScheme, peer: &str) -> Result<Self, SyncError> {
        Self::new(
            manager,
            scheme,
            PropertyAddress::new(peer, "", "SharedObjectRegistry", "objectIds"),
        )
    }

    /// Component kinds of an object, `{root}/{object}/ObjectDNA/components`.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be registered.
    pub fn components(manager: &mut ConnectionManager, scheme: &TopicScheme, root: &str, object: &str) -> Result<Self, SyncError> {
        Self::new(
            manager,
            scheme,
            PropertyAddress::new(root, object, "ObjectDNA", "components"),
        )
    }

    /// Confirmed members.
    #[must_use]
    pub fn ids(&self) -> &BTreeSet<String> {
        self.property.get()
    }

    /// Whether `id` is a confirmed member.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.property.get().contains(id)
    }

    /// Edits waiting for the handshake.
    #[must_use]
    pub fn buffered(&self) -> &SetBuffer {
        &self.buffer
    }

    /// Whether the handshake for this session completed.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.property.is_established()
    }

    /// Underlying property topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.property.topic()
    }

    /// Register the change callback; see [`ReplicatedProperty::on_change`].
    pub fn on_change(&mut self, callback: impl FnMut(&BTreeSet<String>, &str) + 'static) {
        self.property.on_change(callback);
    }

    fn merge_buffer(&mut self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        let changed = self.buffer.drain_into(self.property.value_mut());
        if changed {
            self.property.mark_dirty();
        }
        changed
    }

    /// Add `id`.
    ///
    /// Until the current session is established (including the gap after
    /// the link dropped) the add is buffered and merged later.
    pub fn add(&mut self, id: &str) {
        if self.property.is_established() {
            let merged = self.merge_buffer();
            if self.property.value_mut().insert(id.to_string()) || merged {
                self.property.mark_dirty();
            }
        } else {
            tracing::debug!(id, topic = %self.property.topic(), "Buffering registry add");
            self.buffer.add(id);
            self.property.mark_dirty();
        }
    }

    /// Remove `id`.
    ///
    /// Before the handshake the removal is kept as a tombstone and applied
    /// when the buffer is merged.
    pub fn remove(&mut self, id: &str) {
        if self.property.is_established() {
            let merged = self.merge_buffer();
            if self.property.value_mut().remove(id) || merged {
                self.property.mark_dirty();
            }
        } else {
            tracing::debug!(id, topic = %self.property.topic(), "Buffering registry removal");
            self.buffer.remove(id);
            self.property.mark_dirty();
        }
    }

    /// Apply inbound state, fold in buffered edits once safe, then flush.
    ///
    /// # Errors
    ///
    /// Returns error if the set cannot be serialized.
    pub fn update(&mut self, manager: &mut ConnectionManager, now: Instant) -> Result<(), SyncError> {
        let received = self.property.receive(manager);
        if (received > 0 || self.property.is_established()) && self.merge_buffer() {
            tracing::debug!(topic = %self.property.topic(), len = self.ids().len(), "Merged buffered registry edits");
        }
        self.property.update(manager, now)
    }

    /// Drop the subscriptions.
    pub fn detach(self, manager: &mut ConnectionManager) {
        self.property.detach(manager);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{scripted, Call};
    use crate::manager::{ConnectionPhase, ConnectionSettings};
    use mwsync_proto::{Envelope, Message, QoS, ECHO_TOPIC};
    use std::time::Duration;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn well_known_topics() {
        let (mut manager, _script) = scripted(ConnectionSettings::default());
        let scheme = TopicScheme::default();
        assert_eq!(
            SetRegistry::peers(&mut manager, &scheme).unwrap().topic(),
            "Main/SharedProperty/GLOBAL/PeerRegistry/peerIds"
        );
        assert_eq!(
            SetRegistry::objects(&mut manager, &scheme).unwrap().topic(),
            "Main/SharedProperty/GLOBAL/ObjectRegistry/objectIds"
        );
        assert_eq!(
            SetRegistry::children(&mut manager, &scheme, "1A4B6F2C").unwrap().topic(),
            "Main/SharedProperty/1A4B6F2C/SharedObjectRegistry/objectIds"
        );
        assert_eq!(
            SetRegistry::components(&mut manager, &scheme, "1A4B6F2C", "cube").unwrap().topic(),
            "Main/SharedProperty/1A4B6F2C/cube/ObjectDNA/components"
        );
    }

    #[test]
    fn offline_edits_buffer_then_merge_once() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut registry = SetRegistry::peers(&mut manager, &TopicScheme::default()).unwrap();

        for _ in 0..3 {
            registry.add("x");
        }
        registry.add("gone");
        registry.remove("gone");
        assert!(registry.ids().is_empty());
        assert!(!registry.buffered().is_empty());

        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();

        // retained state from another peer arrives before the echo
        let retained = Envelope::wrap("0BADF00D", true, &ids(&["gone", "y"]))
            .unwrap()
            .to_json()
            .unwrap();
        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(registry.topic(), retained));
        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        registry.update(&mut manager, now).unwrap();

        assert_eq!(*registry.ids(), ids(&["x", "y"]));
        assert!(registry.buffered().is_empty());

        let topic = registry.topic().to_string();
        let published = script
            .calls
            .borrow()
            .iter()
            .rev()
            .find_map(|c| match c {
                Call::Publish(t, payload, QoS::AtMostOnce, true) if *t == topic => Some(payload.clone()),
                _ => None,
            })
            .unwrap();
        let envelope = Envelope::from_json(&published).unwrap();
        assert!(envelope.meta.echo);
        assert_eq!(envelope.value::<BTreeSet<String>>().unwrap(), ids(&["x", "y"]));
    }

    #[test]
    fn established_edits_apply_directly() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut registry = SetRegistry::objects(&mut manager, &TopicScheme::default()).unwrap();
        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();
        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        registry.update(&mut manager, now).unwrap();
        assert!(registry.is_established());

        registry.add("a");
        assert!(registry.contains("a"));
        assert!(registry.buffered().is_empty());
        registry.remove("a");
        assert!(!registry.contains("a"));
    }

    #[test]
    fn add_right_after_link_loss_survives_reconnect() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut registry = SetRegistry::peers(&mut manager, &TopicScheme::default()).unwrap();
        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();
        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        registry.update(&mut manager, now).unwrap();
        registry.add("a");
        registry.update(&mut manager, now).unwrap();
        assert_eq!(*registry.ids(), ids(&["a"]));

        // the manager notices the drop before the registry is updated again
        script.link_up.set(false);
        manager.tick(now);
        assert!(matches!(manager.phase(), ConnectionPhase::ReconnectWait { .. }));
        assert!(!registry.is_established());
        registry.add("x");
        assert!(!registry.contains("x"));
        assert!(!registry.buffered().is_empty());

        let later = now + Duration::from_secs(3);
        manager.tick(later);
        manager.tick(later);
        assert!(manager.is_connected());

        // broker replays our own retained set, then the handshake echo
        let retained = Envelope::wrap(peer.as_str(), true, &ids(&["a"])).unwrap().to_json().unwrap();
        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(registry.topic(), retained));
        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(later);
        registry.update(&mut manager, later).unwrap();

        assert_eq!(*registry.ids(), ids(&["a", "x"]));
        assert!(registry.buffered().is_empty());
    }

    #[test]
    fn inbound_change_notifies() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut registry = SetRegistry::peers(&mut manager, &TopicScheme::default()).unwrap();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(BTreeSet::new()));
        let sink = std::rc::Rc::clone(&seen);
        registry.on_change(move |set, _| *sink.borrow_mut() = set.clone());

        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let payload = Envelope::wrap("0BADF00D", true, &ids(&["p1", "p2"]))
            .unwrap()
            .to_json()
            .unwrap();
        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(registry.topic(), payload));
        manager.tick(now);
        registry.update(&mut manager, now).unwrap();
        assert_eq!(*seen.borrow(), ids(&["p1", "p2"]));
    }
}
