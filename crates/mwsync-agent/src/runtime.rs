//! Agent runtime.

use crate::config::AgentConfig;
use crate::directory::PeerDirectory;
use anyhow::Result;
use mwsync_proto::{LastWill, PropertyAddress, QoS, TopicScheme};
use mwsync_replica::{ConnectionEvent, ConnectionManager, Endpoint};
use mwsync_transport::MqttFactory;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Main agent struct.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run the agent until interrupted.
    ///
    /// # Errors
    ///
    /// Returns error if the broker configuration is invalid.
    pub async fn run(self) -> Result<()> {
        let broker = self.config.broker_settings()?;
        tracing::info!(host = %broker.host, port = broker.effective_port(), tls = broker.tls.is_enabled(), "Using broker");

        let client_id = self.config.client_id.unwrap_or_else(Uuid::new_v4);
        let mut manager = ConnectionManager::with_client_id(
            Box::new(MqttFactory::new(broker)),
            self.config.connection_settings(),
            client_id,
        );
        let peer_id = manager.peer_id().to_string();
        tracing::info!(%client_id, peer = %peer_id, "Agent identity");

        let scheme = TopicScheme::new(self.config.sync.main_topic.as_str());
        let presence = Endpoint::new(
            scheme.property(&PropertyAddress::new(peer_id.as_str(), "", "Presence", "online")),
            true,
        );
        let will_topic = format!("{}{}", manager.global_prefix(), presence.topic());
        manager.set_last_will(Some(LastWill::new(will_topic, vec![0], QoS::AtLeastOnce, true)))?;

        let announce = Rc::new(Cell::new(false));
        let flag = Rc::clone(&announce);
        manager.add_listener(move |event| {
            tracing::info!(?event, "Connection event");
            if event == ConnectionEvent::Connected {
                flag.set(true);
            }
        });

        let mut directory = PeerDirectory::new(&mut manager, &scheme, self.config.heartbeat, Instant::now())?;
        manager.connect()?;

        let mut ticker = tokio::time::interval(self.config.sync.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    manager.tick(now);

                    if announce.replace(false) {
                        if let Err(e) = presence.send(&mut manager, true) {
                            tracing::warn!(error = %e, "Failed to announce presence");
                        }
                    }

                    if let Err(e) = directory.update(&mut manager, now) {
                        tracing::warn!(error = %e, "Peer directory update failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        directory.leave(&mut manager, Instant::now());
        if manager.is_connected() {
            if let Err(e) = presence.send(&mut manager, false) {
                tracing::warn!(error = %e, "Failed to withdraw presence");
            }
        }
        manager.disconnect();
        tracing::info!("Agent stopped");

        Ok(())
    }
}
