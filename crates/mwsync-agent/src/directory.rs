//! Live view of the peers sharing the broker.
//!
//! Every agent lists itself in the global peer registry and beats on its own
//! root. Each other listed peer gets a receiving heartbeat; a peer that goes
//! silent is dropped from the registry so the rest of the group forgets it
//! too. A live peer that was dropped by mistake re-adds itself.

use crate::config::HeartbeatConfig;
use mwsync_core::{SetDiff, SharedMode};
use mwsync_proto::TopicScheme;
use mwsync_replica::{ConnectionManager, Heartbeat, HeartbeatEvent, SetRegistry, SyncError};
use std::collections::BTreeMap;
use std::time::Instant;

/// Peer directory.
pub struct PeerDirectory {
    self_id: String,
    scheme: TopicScheme,
    timing: HeartbeatConfig,
    registry: SetRegistry,
    own_beat: Heartbeat,
    peers: BTreeMap<String, Heartbeat>,
}

impl PeerDirectory {
    /// Register this peer and start beating.
    ///
    /// # Errors
    ///
    /// Returns error if the subscriptions cannot be registered.
    pub fn new(
        manager: &mut ConnectionManager,
        scheme: &TopicScheme,
        timing: HeartbeatConfig,
        now: Instant,
    ) -> Result<Self, SyncError> {
        let self_id = manager.peer_id().to_string();

        let mut registry = SetRegistry::peers(manager, scheme)?;
        registry.add(&self_id);

        let own_beat = Heartbeat::new(
            manager,
            scheme,
            &self_id,
            "",
            SharedMode::Sender,
            timing.interval,
            timing.grace,
            now,
        )?;

        Ok(Self {
            self_id,
            scheme: scheme.clone(),
            timing,
            registry,
            own_beat,
            peers: BTreeMap::new(),
        })
    }

    /// Peers currently tracked, excluding this one.
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    /// Advance the registry and all heartbeats.
    ///
    /// # Errors
    ///
    /// Returns error if a heartbeat cannot be registered or serialized.
    pub fn update(&mut self, manager: &mut ConnectionManager, now: Instant) -> Result<(), SyncError> {
        if self.registry.is_established() && !self.registry.contains(&self.self_id) {
            tracing::info!(peer = %self.self_id, "Re-registering in peer directory");
            self.registry.add(&self.self_id);
        }
        self.registry.update(manager, now)?;

        if self.own_beat.update(manager, now)? == HeartbeatEvent::RefreshRequested {
            tracing::warn!("Own heartbeat went unanswered");
        }

        self.reconcile(manager, now)?;

        let mut expired = Vec::new();
        for (peer, heartbeat) in &mut self.peers {
            if heartbeat.update(manager, now)? == HeartbeatEvent::Expired {
                expired.push(peer.clone());
            }
        }
        for peer in expired {
            tracing::warn!(%peer, "Peer heartbeat expired");
            self.registry.remove(&peer);
        }

        Ok(())
    }

    fn reconcile(&mut self, manager: &mut ConnectionManager, now: Instant) -> Result<(), SyncError> {
        let self_id = &self.self_id;
        let diff = SetDiff::between(
            self.registry.ids().iter().filter(|id| *id != self_id),
            self.peers.keys(),
        );

        for peer in diff.removed {
            if let Some(heartbeat) = self.peers.remove(&peer) {
                heartbeat.detach(manager);
                tracing::info!(%peer, "Peer left");
            }
        }

        for peer in diff.added {
            let heartbeat = Heartbeat::new(
                manager,
                &self.scheme,
                &peer,
                "",
                SharedMode::Receiver,
                self.timing.interval,
                self.timing.grace,
                now,
            )?;
            tracing::info!(%peer, "Peer joined");
            self.peers.insert(peer, heartbeat);
        }

        Ok(())
    }

    /// Remove this peer from the registry and drop every subscription.
    pub fn leave(mut self, manager: &mut ConnectionManager, now: Instant) {
        self.registry.remove(&self.self_id);
        if let Err(e) = self.registry.update(manager, now) {
            tracing::warn!(error = %e, "Failed to publish departure");
        }

        for heartbeat in self.peers.into_values() {
            heartbeat.detach(manager);
        }
        self.own_beat.detach(manager);
        self.registry.detach(manager);
    }
}
