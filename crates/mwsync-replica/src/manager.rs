//! Process-wide owner of the broker connection.
//!
//! The manager is driven by [`ConnectionManager::tick`], called once per
//! scheduler step. Every wait (handshake polling, reconnect delay) is a
//! phase of an explicit state machine advanced by that tick:
//!
//! ```text
//!           connect()            poll ok
//! Idle ───────────────▶ Connecting ───────▶ Connected
//!  ▲                        │                   │
//!  │ disconnect()      poll err            link lost
//!  │                        ▼                   │
//!  └──────────────── ReconnectWait ◀────────────┘
//!      (no auto-reconnect)   │ delay elapsed
//!                            └──────▶ Connecting
//! ```

use crate::subscriptions::{Callback, CallbackId, SubscriptionIndex};
use crate::SyncError;
use mwsync_core::NameHash32;
use mwsync_proto::{LastWill, Message, QoS};
use mwsync_transport::{ConnectRequest, Credentials, Transport, TransportFactory};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::task::Poll;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Fixed delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Connection-level settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Prepended to every topic on the wire
    pub global_prefix: String,
    /// Optional broker authentication
    pub credentials: Option<Credentials>,
    /// Retry failed or lost connections
    pub auto_reconnect: bool,
    /// Delay before each retry
    pub reconnect_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            global_prefix: String::new(),
            credentials: None,
            auto_reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Where the manager is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No connection and none scheduled
    Idle,
    /// Waiting for the transport handshake
    Connecting,
    /// Link up, pump running
    Connected,
    /// Waiting out the reconnect delay
    ReconnectWait {
        /// When the next attempt starts
        until: Instant,
    },
}

/// Lifecycle notification delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt is starting
    Connecting,
    /// The link is up and subscriptions were replayed
    Connected,
    /// A connected link is about to be closed on purpose
    Disconnecting,
    /// A previously connected link is gone
    Disconnected,
}

/// Identifies a registered connection listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Returned by [`ConnectionManager::subscribe`]; pass back to unsubscribe.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pattern: String,
    id: CallbackId,
}

impl SubscriptionHandle {
    /// Topic pattern the callback is registered under.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

type Listener = Rc<dyn Fn(ConnectionEvent)>;

/// Epoch of the live session, `None` while the link is down.
///
/// Shared with properties so they can tell a stale handshake apart from a
/// current one without waiting for their next update.
pub(crate) type SessionWatch = Rc<Cell<Option<u64>>>;

/// Owns the one transport connection of this process.
pub struct ConnectionManager {
    factory: Box<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    settings: ConnectionSettings,
    last_will: Option<LastWill>,
    phase: ConnectionPhase,
    subscriptions: SubscriptionIndex,
    listeners: BTreeMap<ListenerId, Listener>,
    next_listener: u64,
    client_id: Uuid,
    peer_id: NameHash32,
    /// `Connected` was raised and `Disconnected` not yet
    announced: bool,
    /// Auto-reconnect is wanted for the current session
    reconnecting: bool,
    suspended: bool,
    epoch: u64,
    session: SessionWatch,
    refresh_generation: u64,
}

impl ConnectionManager {
    /// Create an idle manager with a random client id.
    #[must_use]
    pub fn new(factory: Box<dyn TransportFactory>, settings: ConnectionSettings) -> Self {
        Self::with_client_id(factory, settings, Uuid::new_v4())
    }

    /// Create an idle manager with a fixed client id.
    #[must_use]
    pub fn with_client_id(factory: Box<dyn TransportFactory>, settings: ConnectionSettings, client_id: Uuid) -> Self {
        Self {
            factory,
            transport: None,
            settings,
            last_will: None,
            phase: ConnectionPhase::Idle,
            subscriptions: SubscriptionIndex::new(),
            listeners: BTreeMap::new(),
            next_listener: 0,
            client_id,
            peer_id: NameHash32::from_client_id(client_id),
            announced: false,
            reconnecting: false,
            suspended: false,
            epoch: 0,
            session: Rc::new(Cell::new(None)),
            refresh_generation: 0,
        }
    }

    /// MQTT client id.
    #[must_use]
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Stable hashed id stamped on every envelope this peer publishes.
    #[must_use]
    pub fn peer_id(&self) -> NameHash32 {
        self.peer_id
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Whether the link is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Incremented on every successful connect.
    ///
    /// Properties compare it against the value they last saw to notice a
    /// new session (re-handshake, accept own retained state once).
    #[must_use]
    pub fn connection_epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn session_watch(&self) -> SessionWatch {
        Rc::clone(&self.session)
    }

    /// Incremented by [`request_refresh_all`](Self::request_refresh_all).
    #[must_use]
    pub fn refresh_generation(&self) -> u64 {
        self.refresh_generation
    }

    /// Live subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionIndex {
        &self.subscriptions
    }

    /// Global topic prefix.
    #[must_use]
    pub fn global_prefix(&self) -> &str {
        &self.settings.global_prefix
    }

    fn configurable(&self, what: &'static str) -> Result<(), SyncError> {
        match self.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Connected => Err(SyncError::ConfigurationLocked(what)),
            ConnectionPhase::Idle | ConnectionPhase::ReconnectWait { .. } => Ok(()),
        }
    }

    /// Change the global topic prefix.
    ///
    /// # Errors
    ///
    /// Returns error while connected or connecting.
    pub fn set_global_prefix(&mut self, prefix: impl Into<String>) -> Result<(), SyncError> {
        self.configurable("global prefix")?;
        self.settings.global_prefix = prefix.into();
        Ok(())
    }

    /// Set or clear the last will registered on the next connect.
    ///
    /// The will is read afresh for every attempt, including automatic
    /// reconnects, so a will changed during [`ConnectionPhase::ReconnectWait`]
    /// goes out with the next attempt. Listeners have no manager access; set
    /// the will before [`connect`](Self::connect) or between attempts.
    ///
    /// # Errors
    ///
    /// Returns error while connected or connecting.
    pub fn set_last_will(&mut self, last_will: Option<LastWill>) -> Result<(), SyncError> {
        self.configurable("last will")?;
        self.last_will = last_will;
        Ok(())
    }

    /// Set or clear broker credentials.
    ///
    /// # Errors
    ///
    /// Returns error while connected or connecting.
    pub fn set_credentials(&mut self, credentials: Option<Credentials>) -> Result<(), SyncError> {
        self.configurable("credentials")?;
        self.settings.credentials = credentials;
        Ok(())
    }

    /// Register a lifecycle listener.
    ///
    /// Listeners only observe; they cannot call back into the manager.
    pub fn add_listener(&mut self, listener: impl Fn(ConnectionEvent) + 'static) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.insert(id, Rc::new(listener));
        id
    }

    /// Remove a lifecycle listener. Returns `false` if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    fn emit(&self, event: ConnectionEvent) {
        let listeners: Vec<Listener> = self.listeners.values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn request(&self) -> ConnectRequest {
        ConnectRequest {
            client_id: self.client_id.to_string(),
            last_will: self.last_will.clone(),
            credentials: self.settings.credentials.clone(),
        }
    }

    fn prefixed(&self, topic: &str) -> String {
        format!("{}{topic}", self.settings.global_prefix)
    }

    /// Start a fresh connection, tearing down any previous one.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot even be constructed (bad TLS
    /// setup and the like). Network failures are retried, not returned.
    pub fn connect(&mut self) -> Result<(), SyncError> {
        self.teardown(true);
        self.suspended = false;
        self.reconnecting = self.settings.auto_reconnect;
        self.start_attempt()
    }

    fn start_attempt(&mut self) -> Result<(), SyncError> {
        self.emit(ConnectionEvent::Connecting);
        let mut transport = self.factory.create()?;
        transport.connect(&self.request())?;
        tracing::info!(client_id = %self.client_id, peer_id = %self.peer_id, "Connecting");
        self.transport = Some(transport);
        self.phase = ConnectionPhase::Connecting;
        Ok(())
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&mut self) {
        self.reconnecting = false;
        self.suspended = false;
        self.teardown(true);
    }

    /// Close the connection but keep the transport for [`resume`](Self::resume).
    pub fn suspend(&mut self) {
        if self.suspended {
            return;
        }
        tracing::info!("Suspending connection");
        self.suspended = true;
        self.teardown(false);
    }

    /// Reconnect after [`suspend`](Self::suspend). No-op if not suspended.
    ///
    /// # Errors
    ///
    /// Returns error if the connect cannot be started.
    pub fn resume(&mut self) -> Result<(), SyncError> {
        if !self.suspended {
            return Ok(());
        }
        self.suspended = false;
        tracing::info!("Resuming connection");

        if self.transport.is_none() {
            return self.start_attempt();
        }

        self.emit(ConnectionEvent::Connecting);
        let request = self.request();
        if let Some(transport) = self.transport.as_mut() {
            transport.connect(&request)?;
        }
        self.phase = ConnectionPhase::Connecting;
        Ok(())
    }

    fn teardown(&mut self, discard: bool) {
        self.session.set(None);
        let announced = std::mem::take(&mut self.announced);
        if announced {
            self.emit(ConnectionEvent::Disconnecting);
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect();
        }
        if discard {
            self.transport = None;
        }
        self.phase = ConnectionPhase::Idle;
        if announced {
            tracing::info!("Disconnected");
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.reconnecting {
            let delay = self.settings.reconnect_delay;
            tracing::info!(delay_ms = delay.as_millis(), "Reconnect scheduled");
            self.phase = ConnectionPhase::ReconnectWait { until: now + delay };
        } else {
            self.phase = ConnectionPhase::Idle;
        }
    }

    /// Advance the state machine and pump inbound messages.
    pub fn tick(&mut self, now: Instant) {
        match self.phase {
            ConnectionPhase::Idle => {}
            ConnectionPhase::ReconnectWait { until } => {
                if now >= until {
                    if let Err(e) = self.start_attempt() {
                        tracing::warn!(error = %e, "Reconnect attempt could not start");
                        self.transport = None;
                        self.schedule_reconnect(now);
                    }
                }
            }
            ConnectionPhase::Connecting => self.poll_connect(now),
            ConnectionPhase::Connected => self.pump(now),
        }
    }

    fn poll_connect(&mut self, now: Instant) {
        let Some(transport) = self.transport.as_mut() else {
            self.schedule_reconnect(now);
            return;
        };

        match transport.poll_connect() {
            Poll::Pending => {}
            Poll::Ready(Ok(())) => {
                self.phase = ConnectionPhase::Connected;
                self.epoch += 1;
                self.session.set(Some(self.epoch));
                self.init_subscriptions();
                self.announced = true;
                tracing::info!(epoch = self.epoch, subscriptions = self.subscriptions.len(), "Connected");
                self.emit(ConnectionEvent::Connected);
            }
            Poll::Ready(Err(e)) => {
                tracing::warn!(error = %e, "Connection attempt failed");
                transport.disconnect();
                self.transport = None;
                self.schedule_reconnect(now);
            }
        }
    }

    fn init_subscriptions(&mut self) {
        let prefix = self.settings.global_prefix.clone();
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        for (pattern, qos) in self.subscriptions.patterns() {
            let topic = format!("{prefix}{pattern}");
            if let Err(e) = transport.subscribe(&topic, qos) {
                tracing::warn!(topic, error = %e, "Failed to replay subscription");
            }
        }
    }

    fn pump(&mut self, now: Instant) {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                self.connection_lost(now);
                return;
            };
            if !transport.is_connected() {
                self.connection_lost(now);
                return;
            }
            let Some(message) = transport.try_receive() else {
                return;
            };

            let topic = message
                .topic
                .strip_prefix(self.settings.global_prefix.as_str())
                .unwrap_or(&message.topic)
                .to_string();
            tracing::trace!(topic, payload_len = message.payload.len(), "Dispatching message");
            let delivered = self.subscriptions.dispatch(&Message::new(topic, message.payload));
            if delivered == 0 {
                tracing::trace!("Message matched no subscription");
            }
        }
    }

    fn connection_lost(&mut self, now: Instant) {
        tracing::warn!("Lost connection to broker");
        self.session.set(None);
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
        if std::mem::take(&mut self.announced) {
            self.emit(ConnectionEvent::Disconnected);
        }
        self.schedule_reconnect(now);
    }

    /// Register `callback` for messages matching `pattern`.
    ///
    /// The transport is only asked to subscribe for the first callback of a
    /// pattern or a QoS upgrade. While disconnected the subscription is
    /// recorded and replayed on the next connect.
    ///
    /// # Errors
    ///
    /// Returns error if `pattern` is not a valid topic filter.
    pub fn subscribe(&mut self, pattern: &str, qos: QoS, callback: impl Fn(&Message) + 'static) -> Result<SubscriptionHandle, SyncError> {
        let callback: Callback = Rc::new(callback);
        let (id, action) = self.subscriptions.add(pattern, qos, callback)?;

        if let Some(qos) = action {
            tracing::info!(topic = pattern, %qos, "Subscribing");
            if self.is_connected() {
                let topic = self.prefixed(pattern);
                if let Some(transport) = self.transport.as_mut() {
                    if let Err(e) = transport.subscribe(&topic, qos) {
                        tracing::warn!(topic, error = %e, "Transport subscribe failed");
                    }
                }
            }
        }

        Ok(SubscriptionHandle {
            pattern: pattern.to_string(),
            id,
        })
    }

    /// Deregister a callback; the last one for a pattern unsubscribes it.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        if !self.subscriptions.remove(&handle.pattern, handle.id) {
            return;
        }
        tracing::info!(topic = %handle.pattern, "Unsubscribing");
        if self.is_connected() {
            let topic = self.prefixed(&handle.pattern);
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.unsubscribe(&topic) {
                    tracing::warn!(topic, error = %e, "Transport unsubscribe failed");
                }
            }
        }
    }

    /// Publish under the global prefix.
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the transport refuses the publish.
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let topic = self.prefixed(topic);
        let transport = self.transport.as_mut().ok_or(SyncError::NotConnected)?;
        tracing::trace!(topic, payload_len = payload.len(), %qos, retain, "Publishing");
        transport.publish(&topic, payload, qos, retain)?;
        Ok(())
    }

    /// Ask every live property to re-publish on its next update.
    pub fn request_refresh_all(&mut self) {
        self.refresh_generation += 1;
        tracing::debug!(generation = self.refresh_generation, "Refresh requested for all properties");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}
