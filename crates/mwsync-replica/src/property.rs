//! Typed variable mirrored to one broker topic.
//!
//! Inbound messages are only queued by the subscription callback; they are
//! applied, and change callbacks fired, from [`ReplicatedProperty::update`]
//! on the next scheduler step. Publishing waits for the `Echo/Test`
//! handshake, which proves the broker has finished replaying retained state
//! for this session.

use crate::manager::{ConnectionManager, SessionWatch, SubscriptionHandle};
use crate::SyncError;
use mwsync_core::{PropertyStatus, SharedMode};
use mwsync_proto::{Envelope, Message, PropertyAddress, QoS, TopicScheme, ECHO_TOPIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Interval between unanswered handshake attempts.
pub const HANDSHAKE_RETRY: Duration = Duration::from_secs(3);

/// How a property takes part in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyOptions {
    /// Publish and/or apply inbound updates
    pub mode: SharedMode,
    /// Stamped on outbound envelopes; receivers apply their own id's
    /// updates only when it is set
    pub allow_echo: bool,
    /// QoS of the property topic subscription
    pub subscribe_qos: QoS,
}

impl Default for PropertyOptions {
    fn default() -> Self {
        Self {
            mode: SharedMode::Both,
            allow_echo: false,
            subscribe_qos: QoS::AtMostOnce,
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Update(Message),
    Echo(Vec<u8>),
}

type Inbox = Rc<RefCell<VecDeque<Inbound>>>;

type ChangeCallback<T> = Box<dyn FnMut(&T, &str)>;

/// A named, typed value replicated through the broker.
pub struct ReplicatedProperty<T> {
    address: PropertyAddress,
    topic: String,
    value: T,
    status: PropertyStatus,
    options: PropertyOptions,
    peer_id: String,
    inbox: Inbox,
    handles: Vec<SubscriptionHandle>,
    established: bool,
    session: SessionWatch,
    accept_own_once: bool,
    seen_epoch: u64,
    seen_refresh: u64,
    last_attempt: Option<Instant>,
    last_handshake: Option<Instant>,
    last_flush: Option<Instant>,
    on_change: Option<ChangeCallback<T>>,
}

fn enqueue(inbox: &Weak<RefCell<VecDeque<Inbound>>>, item: Inbound) {
    if let Some(inbox) = inbox.upgrade() {
        inbox.borrow_mut().push_back(item);
    }
}

impl<T> ReplicatedProperty<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Declare a property and subscribe to its topic and the handshake
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is not a valid subscription pattern.
    pub fn new(
        manager: &mut ConnectionManager,
        scheme: &TopicScheme,
        address: PropertyAddress,
        initial: T,
        options: PropertyOptions,
    ) -> Result<Self, SyncError> {
        let topic = scheme.property(&address);
        let inbox: Inbox = Rc::new(RefCell::new(VecDeque::new()));

        let weak = Rc::downgrade(&inbox);
        let value_handle = manager.subscribe(&topic, options.subscribe_qos, move |message| {
            enqueue(&weak, Inbound::Update(message.clone()));
        })?;

        let weak = Rc::downgrade(&inbox);
        let echo_handle = match manager.subscribe(ECHO_TOPIC, QoS::AtMostOnce, move |message| {
            enqueue(&weak, Inbound::Echo(message.payload.clone()));
        }) {
            Ok(handle) => handle,
            Err(e) => {
                manager.unsubscribe(value_handle);
                return Err(e);
            }
        };

        tracing::debug!(topic, mode = ?options.mode, allow_echo = options.allow_echo, "Declared replicated property");

        Ok(Self {
            address,
            topic,
            value: initial,
            status: PropertyStatus::New,
            options,
            peer_id: manager.peer_id().to_string(),
            inbox,
            handles: vec![value_handle, echo_handle],
            established: false,
            session: manager.session_watch(),
            accept_own_once: false,
            seen_epoch: 0,
            seen_refresh: manager.refresh_generation(),
            last_attempt: None,
            last_handshake: None,
            last_flush: None,
            on_change: None,
        })
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replace the value and mark it dirty.
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.status = PropertyStatus::Dirty;
    }

    /// Mutate the value in place and mark it dirty.
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.value);
        self.status = PropertyStatus::Dirty;
        result
    }

    /// Mutable access that leaves the status alone.
    pub(crate) fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Request a flush without changing the value.
    pub fn mark_dirty(&mut self) {
        self.status = PropertyStatus::Dirty;
    }

    /// Register the change callback, replacing any previous one.
    ///
    /// Receives the new value and the id of the peer that published it.
    /// Never invoked for sender-only properties.
    pub fn on_change(&mut self, callback: impl FnMut(&T, &str) + 'static) {
        self.on_change = Some(Box::new(callback));
    }

    /// Replication status.
    #[must_use]
    pub fn status(&self) -> PropertyStatus {
        self.status
    }

    /// Sharing mode.
    #[must_use]
    pub fn mode(&self) -> SharedMode {
        self.options.mode
    }

    /// Change the sharing mode.
    pub fn set_mode(&mut self, mode: SharedMode) {
        self.options.mode = mode;
    }

    /// Wire topic, without the global prefix.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Address the topic was built from.
    #[must_use]
    pub fn address(&self) -> &PropertyAddress {
        &self.address
    }

    /// Whether the handshake for the current session completed.
    ///
    /// Turns false as soon as the manager loses the link, even before the
    /// next [`update`](Self::update).
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.established && self.session.get() == Some(self.seen_epoch)
    }

    /// Time of the last successful flush.
    #[must_use]
    pub fn last_flush(&self) -> Option<Instant> {
        self.last_flush
    }

    fn sync_with(&mut self, manager: &ConnectionManager) {
        let epoch = manager.connection_epoch();
        if epoch != self.seen_epoch && manager.is_connected() {
            self.seen_epoch = epoch;
            self.established = false;
            self.accept_own_once = true;
            self.last_handshake = None;
            self.last_attempt = None;
        } else if !manager.is_connected() && self.established {
            tracing::debug!(topic = %self.topic, "Connection gone, handshake reset");
            self.established = false;
        }

        let generation = manager.refresh_generation();
        if generation != self.seen_refresh {
            self.seen_refresh = generation;
            if self.options.mode.sends() {
                self.status = PropertyStatus::Refresh;
            }
        }
    }

    /// Apply queued inbound updates. Returns how many were accepted.
    pub fn receive(&mut self, manager: &ConnectionManager) -> usize {
        self.sync_with(manager);

        let queued: Vec<Inbound> = self.inbox.borrow_mut().drain(..).collect();
        let mut accepted = 0;
        for item in queued {
            match item {
                Inbound::Echo(payload) => {
                    if !self.established && payload == self.peer_id.as_bytes() {
                        tracing::debug!(topic = %self.topic, "Connection established");
                        self.established = true;
                        // replay is over; later own messages follow the echo flag
                        self.accept_own_once = false;
                    }
                }
                Inbound::Update(message) => {
                    if self.apply(&message) {
                        accepted += 1;
                    }
                }
            }
        }
        accepted
    }

    fn apply(&mut self, message: &Message) -> bool {
        let envelope = match Envelope::from_json(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "Dropping malformed property update");
                return false;
            }
        };

        if envelope.is_from(&self.peer_id) {
            if self.accept_own_once {
                self.accept_own_once = false;
                tracing::debug!(topic = %self.topic, "Accepting own retained state");
            } else if !envelope.meta.echo {
                tracing::trace!(topic = %self.topic, "Ignoring own echo");
                return false;
            }
        }

        let value: T = match envelope.value() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(topic = %message.topic, sender = %envelope.meta.id, error = %e, "Dropping undecodable property value");
                return false;
            }
        };

        self.value = value;
        self.status = PropertyStatus::Received;
        tracing::debug!(topic = %self.topic, sender = %envelope.meta.id, "Applied property update");

        if self.options.mode.receives() {
            if let Some(callback) = self.on_change.as_mut() {
                callback(&self.value, &envelope.meta.id);
            }
        }
        true
    }

    /// Apply inbound updates, then flush or handshake if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn update(&mut self, manager: &mut ConnectionManager, now: Instant) -> Result<(), SyncError> {
        self.receive(manager);
        self.step(manager, now)
    }

    /// Like [`update`](Self::update), but flushes or handshakes at most
    /// once per `idle`. A pending refresh bypasses the throttle.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn update_throttled(&mut self, manager: &mut ConnectionManager, now: Instant, idle: Duration) -> Result<(), SyncError> {
        self.receive(manager);
        if self.status != PropertyStatus::Refresh {
            if let Some(last) = self.last_attempt {
                if now.saturating_duration_since(last) < idle {
                    return Ok(());
                }
            }
        }
        self.step(manager, now)
    }

    /// Handshake in every mode; flush only when sending.
    fn step(&mut self, manager: &mut ConnectionManager, now: Instant) -> Result<(), SyncError> {
        if !manager.is_connected() {
            return Ok(());
        }
        if !self.established {
            self.handshake(manager, now);
            return Ok(());
        }
        if !self.options.mode.sends() || !self.status.wants_flush() {
            return Ok(());
        }
        match self.flush(manager, now) {
            Err(SyncError::Transport(e)) => {
                tracing::warn!(topic = %self.topic, error = %e, "Flush failed, will retry");
                Ok(())
            }
            other => other,
        }
    }

    fn handshake(&mut self, manager: &mut ConnectionManager, now: Instant) {
        if let Some(last) = self.last_handshake {
            if now.saturating_duration_since(last) < HANDSHAKE_RETRY {
                return;
            }
        }
        self.last_handshake = Some(now);
        self.last_attempt = Some(now);
        tracing::debug!(topic = %self.topic, peer_id = %self.peer_id, "Handshake");
        if let Err(e) = manager.publish(ECHO_TOPIC, self.peer_id.as_bytes(), QoS::AtMostOnce, false) {
            tracing::warn!(error = %e, "Handshake publish failed");
        }
    }

    /// Publish the current value now.
    ///
    /// # Errors
    ///
    /// Returns error for receiver-only properties, when not connected, or
    /// when the value cannot be serialized.
    pub fn flush(&mut self, manager: &mut ConnectionManager, now: Instant) -> Result<(), SyncError> {
        if !self.options.mode.sends() {
            return Err(SyncError::ReceiverOnly);
        }
        let payload = Envelope::wrap(self.peer_id.as_str(), self.options.allow_echo, &self.value)?.to_json()?;

        let previous = self.status;
        self.status = PropertyStatus::Sending;
        self.last_attempt = Some(now);
        if let Err(e) = manager.publish(&self.topic, &payload, QoS::AtMostOnce, true) {
            self.status = if previous.wants_flush() {
                previous
            } else {
                PropertyStatus::Dirty
            };
            return Err(e);
        }

        self.status = PropertyStatus::Sent;
        self.last_flush = Some(now);
        tracing::debug!(topic = %self.topic, payload_len = payload.len(), "Flushed property");
        Ok(())
    }

    /// Drop both subscriptions.
    pub fn detach(self, manager: &mut ConnectionManager) {
        tracing::debug!(topic = %self.topic, "Detaching replicated property");
        for handle in self.handles {
            manager.unsubscribe(handle);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReplicatedProperty<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedProperty")
            .field("topic", &self.topic)
            .field("value", &self.value)
            .field("status", &self.status)
            .field("mode", &self.options.mode)
            .field("established", &self.established)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{scripted, Call};
    use crate::manager::ConnectionSettings;
    use serde::Deserialize;
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Pose {
        position_x: f32,
        label: String,
    }

    fn pose(x: f32) -> Pose {
        Pose {
            position_x: x,
            label: "cube".to_string(),
        }
    }

    fn address() -> PropertyAddress {
        PropertyAddress::new("peer", "cube", "Transform", "pose")
    }

    fn envelope(sender: &str, echo: bool, value: &Pose) -> Vec<u8> {
        Envelope::wrap(sender, echo, value).unwrap().to_json().unwrap()
    }

    #[test]
    fn set_marks_dirty() {
        let (mut manager, _script) = scripted(ConnectionSettings::default());
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), PropertyOptions::default())
                .unwrap();
        assert_eq!(property.status(), PropertyStatus::New);
        property.set(pose(1.0));
        assert_eq!(property.status(), PropertyStatus::Dirty);
        assert_eq!(property.topic(), "Main/SharedProperty/peer/cube/Transform/pose");
    }

    #[test]
    fn handshake_before_flush_then_publish_retained() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let scheme = TopicScheme::default();
        let mut property =
            ReplicatedProperty::new(&mut manager, &scheme, address(), pose(0.0), PropertyOptions::default()).unwrap();
        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);

        property.set(pose(2.0));
        property.update(&mut manager, now).unwrap();
        let peer = manager.peer_id().to_string();
        assert_eq!(
            script.count(|c| *c == Call::Publish(ECHO_TOPIC.into(), peer.as_bytes().to_vec(), QoS::AtMostOnce, false)),
            1
        );
        assert_eq!(property.status(), PropertyStatus::Dirty);

        // retry is fixed, not per update
        property.update(&mut manager, now + Duration::from_secs(1)).unwrap();
        assert_eq!(script.count(|c| matches!(c, Call::Publish(t, ..) if t == ECHO_TOPIC)), 1);

        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        property.update(&mut manager, now).unwrap();
        assert!(property.is_established());
        assert_eq!(property.status(), PropertyStatus::Sent);

        let topic = property.topic().to_string();
        let flushed = script
            .calls
            .borrow()
            .iter()
            .find_map(|c| match c {
                Call::Publish(t, payload, qos, retain) if *t == topic => Some((payload.clone(), *qos, *retain)),
                _ => None,
            })
            .unwrap();
        assert_eq!(flushed.1, QoS::AtMostOnce);
        assert!(flushed.2);
        let sent = Envelope::from_json(&flushed.0).unwrap();
        assert_eq!(sent.meta.id, peer);
        assert!(!sent.meta.echo);
        assert_eq!(sent.value::<Pose>().unwrap(), pose(2.0));
    }

    #[test]
    fn own_update_without_echo_is_ignored() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), PropertyOptions::default())
                .unwrap();
        let fired = Rc::new(Cell::new(0));
        let sink = Rc::clone(&fired);
        property.on_change(move |_, _| sink.set(sink.get() + 1));

        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();
        let topic = property.topic().to_string();

        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        property.update(&mut manager, now).unwrap();
        assert!(property.is_established());

        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(topic, envelope(&peer, false, &pose(9.0))));
        manager.tick(now);
        property.update(&mut manager, now).unwrap();

        assert_eq!(fired.get(), 0);
        assert_eq!(*property.get(), pose(0.0));
    }

    #[test]
    fn own_update_with_echo_applies() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let options = PropertyOptions {
            allow_echo: true,
            ..PropertyOptions::default()
        };
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), options).unwrap();
        let origin = Rc::new(RefCell::new(String::new()));
        let sink = Rc::clone(&origin);
        property.on_change(move |_, sender| *sink.borrow_mut() = sender.to_string());

        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();
        let topic = property.topic().to_string();

        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(topic, envelope(&peer, true, &pose(4.0))));
        manager.tick(now);
        property.update(&mut manager, now).unwrap();

        assert_eq!(*property.get(), pose(4.0));
        assert_eq!(property.status(), PropertyStatus::Received);
        assert_eq!(*origin.borrow(), peer);
    }

    #[test]
    fn own_retained_state_accepted_once_per_session() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), PropertyOptions::default())
                .unwrap();
        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();
        let topic = property.topic().to_string();

        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(topic.clone(), envelope(&peer, false, &pose(5.0))));
        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(topic, envelope(&peer, false, &pose(6.0))));
        manager.tick(now);
        assert_eq!(property.receive(&manager), 1);
        assert_eq!(*property.get(), pose(5.0));
    }

    #[test]
    fn foreign_update_notifies_with_sender() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), PropertyOptions::default())
                .unwrap();
        let origin = Rc::new(RefCell::new(String::new()));
        let sink = Rc::clone(&origin);
        property.on_change(move |value: &Pose, sender| {
            assert_eq!(value.label, "cube");
            *sink.borrow_mut() = sender.to_string();
        });

        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let topic = property.topic().to_string();
        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(topic, envelope("0BADF00D", false, &pose(3.0))));
        manager.tick(now);

        // nothing applied inside the pump
        assert_eq!(*property.get(), pose(0.0));
        property.update(&mut manager, now).unwrap();
        assert_eq!(*property.get(), pose(3.0));
        assert_eq!(*origin.borrow(), "0BADF00D");
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(1.0), PropertyOptions::default())
                .unwrap();
        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let topic = property.topic().to_string();

        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(topic.clone(), b"not json".to_vec()));
        let wrong_type = Envelope::wrap("0BADF00D", false, &42u32).unwrap().to_json().unwrap();
        script.inbound.borrow_mut().push_back(Message::new(topic, wrong_type));
        manager.tick(now);
        assert_eq!(property.receive(&manager), 0);
        assert_eq!(*property.get(), pose(1.0));
    }

    #[test]
    fn sender_only_skips_change_callback() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let options = PropertyOptions {
            mode: SharedMode::Sender,
            ..PropertyOptions::default()
        };
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), options).unwrap();
        let fired = Rc::new(Cell::new(false));
        let sink = Rc::clone(&fired);
        property.on_change(move |_, _| sink.set(true));

        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let topic = property.topic().to_string();
        script
            .inbound
            .borrow_mut()
            .push_back(Message::new(topic, envelope("0BADF00D", false, &pose(8.0))));
        manager.tick(now);
        property.update(&mut manager, now).unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn receiver_only_never_publishes() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let options = PropertyOptions {
            mode: SharedMode::Receiver,
            ..PropertyOptions::default()
        };
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), options).unwrap();
        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);

        property.set(pose(1.0));
        property.update(&mut manager, now).unwrap();
        let peer = manager.peer_id().to_string();
        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        property.update(&mut manager, now).unwrap();
        property.update(&mut manager, now + Duration::from_secs(10)).unwrap();

        // the handshake still runs, the value never goes out
        assert!(property.is_established());
        assert_eq!(script.count(|c| matches!(c, Call::Publish(t, ..) if t == ECHO_TOPIC)), 1);
        let topic = property.topic().to_string();
        assert_eq!(script.count(|c| matches!(c, Call::Publish(t, ..) if *t == topic)), 0);
        assert!(matches!(property.flush(&mut manager, now), Err(SyncError::ReceiverOnly)));
    }

    #[test]
    fn link_loss_clears_establishment_immediately() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), PropertyOptions::default())
                .unwrap();
        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();
        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        property.update(&mut manager, now).unwrap();
        assert!(property.is_established());

        script.link_up.set(false);
        manager.tick(now);
        assert!(!property.is_established());

        // a new session needs a new handshake
        manager.tick(now + Duration::from_secs(3));
        manager.tick(now + Duration::from_secs(3));
        assert!(manager.is_connected());
        assert!(!property.is_established());
    }

    #[test]
    fn throttle_skips_until_idle_but_refresh_bypasses() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), PropertyOptions::default())
                .unwrap();
        let now = Instant::now();
        let idle = Duration::from_millis(500);
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();
        let topic = property.topic().to_string();
        let log = Rc::clone(&script);
        let flushes = || log.count(|c| matches!(c, Call::Publish(t, ..) if *t == topic));

        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        property.set(pose(1.0));
        property.update_throttled(&mut manager, now, idle).unwrap();
        assert_eq!(flushes(), 1);

        property.set(pose(2.0));
        property.update_throttled(&mut manager, now + Duration::from_millis(100), idle).unwrap();
        assert_eq!(flushes(), 1);

        manager.request_refresh_all();
        property.update_throttled(&mut manager, now + Duration::from_millis(200), idle).unwrap();
        assert_eq!(flushes(), 2);
        assert_eq!(property.status(), PropertyStatus::Sent);

        property.set(pose(3.0));
        property.update_throttled(&mut manager, now + Duration::from_millis(800), idle).unwrap();
        assert_eq!(flushes(), 3);
    }

    #[test]
    fn reconnect_requires_new_handshake() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), PropertyOptions::default())
                .unwrap();
        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        let peer = manager.peer_id().to_string();
        property.update(&mut manager, now).unwrap();
        script.inbound.borrow_mut().push_back(Message::new(ECHO_TOPIC, peer.as_bytes().to_vec()));
        manager.tick(now);
        property.update(&mut manager, now).unwrap();
        assert!(property.is_established());

        script.link_up.set(false);
        manager.tick(now);
        property.update(&mut manager, now).unwrap();
        assert!(!property.is_established());

        let later = now + Duration::from_secs(3);
        manager.tick(later);
        manager.tick(later);
        assert!(manager.is_connected());
        property.update(&mut manager, later).unwrap();
        assert!(!property.is_established());
        assert_eq!(script.count(|c| matches!(c, Call::Publish(t, ..) if t == ECHO_TOPIC)), 2);
    }

    #[test]
    fn detach_unsubscribes() {
        let (mut manager, _script) = scripted(ConnectionSettings::default());
        let property =
            ReplicatedProperty::new(&mut manager, &TopicScheme::default(), address(), pose(0.0), PropertyOptions::default())
                .unwrap();
        assert_eq!(manager.subscriptions().len(), 2);
        property.detach(&mut manager);
        assert!(manager.subscriptions().is_empty());
    }
}
