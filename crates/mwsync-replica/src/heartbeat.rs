//! Liveness beats for shared objects.
//!
//! A sender re-publishes a beat every `interval`. Any traffic on the
//! object's wildcard topic counts as a sign of life; a sender that hears
//! nothing (not even its own beats) for `interval + grace` asks every
//! property to re-publish, and a receiver reports the object expired.
//!
//! The watched wildcard is `{mainTopic}/{objectPath}/#`, where the object
//! path is `root/object` with empty parts collapsed. For a shared object
//! (empty root) that is exactly `{mainTopic}/{objectId}/#`; for a peer-owned
//! one the root is included so two peers' objects with the same id do not
//! keep each other alive.

use crate::manager::{ConnectionManager, SubscriptionHandle};
use crate::property::{PropertyOptions, ReplicatedProperty};
use crate::SyncError;
use chrono::{DateTime, Utc};
use mwsync_core::{PropertyStatus, SharedMode};
use mwsync_proto::{PropertyAddress, QoS, TopicScheme};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Default beat interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Default slack after a missed beat.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Payload of one beat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beat {
    /// Wall-clock time of the beat
    pub last_beat: DateTime<Utc>,
    /// Beats sent in this process
    pub sequence: u64,
}

impl Default for Beat {
    fn default() -> Self {
        Self {
            last_beat: Utc::now(),
            sequence: 0,
        }
    }
}

/// What a heartbeat update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Nothing due
    Idle,
    /// A beat was published
    Beat,
    /// Own beats stopped echoing; a refresh of all properties was requested
    RefreshRequested,
    /// The watched object went silent
    Expired,
}

/// Heartbeat for one object.
pub struct Heartbeat {
    property: ReplicatedProperty<Beat>,
    watch: SubscriptionHandle,
    activity: Rc<Cell<bool>>,
    mode: SharedMode,
    interval: Duration,
    grace: Duration,
    last_activity: Instant,
    last_beat: Option<Instant>,
}

impl Heartbeat {
    /// Start a heartbeat for `root`/`object`.
    ///
    /// # Errors
    ///
    /// Returns error if the subscriptions cannot be registered.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: &mut ConnectionManager,
        scheme: &TopicScheme,
        root: &str,
        object: &str,
        mode: SharedMode,
        interval: Duration,
        grace: Duration,
        now: Instant,
    ) -> Result<Self, SyncError> {
        let address = PropertyAddress::new(root, object, "Heartbeat", "beat");
        let watch_topic = scheme.object_wildcard(&address.object_path());

        let options = PropertyOptions {
            mode,
            ..PropertyOptions::default()
        };
        let property = ReplicatedProperty::new(manager, scheme, address, Beat::default(), options)?;

        let activity = Rc::new(Cell::new(false));
        let seen = Rc::clone(&activity);
        let watch = match manager.subscribe(&watch_topic, QoS::AtMostOnce, move |_| seen.set(true)) {
            Ok(handle) => handle,
            Err(e) => {
                property.detach(manager);
                return Err(e);
            }
        };
        tracing::debug!(topic = %watch_topic, ?mode, "Heartbeat watching");

        Ok(Self {
            property,
            watch,
            activity,
            mode,
            interval,
            grace,
            last_activity: now,
            last_beat: None,
        })
    }

    /// Last beat received or sent.
    #[must_use]
    pub fn beat(&self) -> &Beat {
        self.property.get()
    }

    /// Time of the last observed traffic on the object.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Advance the heartbeat.
    ///
    /// # Errors
    ///
    /// Returns error if the beat cannot be serialized.
    pub fn update(&mut self, manager: &mut ConnectionManager, now: Instant) -> Result<HeartbeatEvent, SyncError> {
        if self.activity.replace(false) {
            self.last_activity = now;
        }
        let deadline = self.last_activity + self.interval + self.grace;

        if self.mode.sends() {
            if self.property.status() == PropertyStatus::Sending {
                return Ok(HeartbeatEvent::Idle);
            }
            let mut event = HeartbeatEvent::Idle;
            if now > deadline {
                tracing::info!("Heartbeat silent, requesting refresh of all properties");
                manager.request_refresh_all();
                self.last_activity = now;
                event = HeartbeatEvent::RefreshRequested;
            }
            let due = self
                .last_beat
                .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
            if due {
                self.property.modify(|beat| {
                    beat.last_beat = Utc::now();
                    beat.sequence += 1;
                });
                self.last_beat = Some(now);
                if event == HeartbeatEvent::Idle {
                    event = HeartbeatEvent::Beat;
                }
            }
            self.property.update(manager, now)?;
            return Ok(event);
        }

        self.property.update(manager, now)?;
        if now > deadline {
            tracing::info!(topic = %self.property.topic(), "Heartbeat expired");
            self.last_activity = now;
            return Ok(HeartbeatEvent::Expired);
        }
        Ok(HeartbeatEvent::Idle)
    }

    /// Drop the subscriptions.
    pub fn detach(self, manager: &mut ConnectionManager) {
        manager.unsubscribe(self.watch);
        self.property.detach(manager);
    }
}
