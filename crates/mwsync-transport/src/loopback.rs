//! In-process broker.
//!
//! Keeps retained messages, routes by MQTT wildcard filters and publishes a
//! client's last will when its connection is severed. Delivery is immediate
//! and ordered; QoS is recorded but every message arrives exactly once.

use crate::{ConnectRequest, Transport, TransportError};
use mwsync_proto::{LastWill, Message, QoS, TopicFilter};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::task::Poll;

#[derive(Debug)]
struct Client {
    client_id: String,
    filters: Vec<(TopicFilter, QoS)>,
    inbox: VecDeque<Message>,
    last_will: Option<LastWill>,
}

impl Client {
    fn wants(&self, topic: &str) -> bool {
        self.filters.iter().any(|(filter, _)| filter.matches(topic))
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    retained: BTreeMap<String, Vec<u8>>,
    clients: BTreeMap<u64, Client>,
    next_session: u64,
    offline: bool,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.to_vec());
            }
        }
        for client in self.clients.values_mut() {
            if client.wants(topic) {
                client.inbox.push_back(Message::new(topic, payload));
            }
        }
    }

    fn sever(&mut self, session: u64) -> Option<String> {
        let client = self.clients.remove(&session)?;
        if let Some(will) = client.last_will {
            tracing::debug!(client_id = %client.client_id, topic = %will.topic, "Publishing last will");
            self.route(&will.topic, &will.payload, will.retain);
        }
        Some(client.client_id)
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    /// Create an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the broker (un)reachable. Going offline severs every client.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        state.offline = !online;
        if !online {
            let sessions: Vec<u64> = state.clients.keys().copied().collect();
            for session in sessions {
                state.sever(session);
            }
        }
    }

    /// Drop a client's connection without a clean DISCONNECT.
    ///
    /// Returns `false` when no client with that id is attached.
    pub fn sever(&self, client_id: &str) -> bool {
        let mut state = self.state.lock();
        let session = state
            .clients
            .iter()
            .find(|(_, client)| client.client_id == client_id)
            .map(|(session, _)| *session);
        session.and_then(|session| state.sever(session)).is_some()
    }

    /// Publish from outside any client.
    pub fn publish(&self, topic: &str, payload: &[u8], retain: bool) {
        self.state.lock().route(topic, payload, retain);
    }

    /// Retained payload on `topic`.
    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Ids of attached clients.
    #[must_use]
    pub fn clients(&self) -> Vec<String> {
        self.state
            .lock()
            .clients
            .values()
            .map(|client| client.client_id.clone())
            .collect()
    }

    /// Filters a client is subscribed to, with their QoS.
    #[must_use]
    pub fn subscriptions(&self, client_id: &str) -> Vec<(String, QoS)> {
        self.state
            .lock()
            .clients
            .values()
            .filter(|client| client.client_id == client_id)
            .flat_map(|client| {
                client
                    .filters
                    .iter()
                    .map(|(filter, qos)| (filter.pattern().to_string(), *qos))
            })
            .collect()
    }

    fn attach(&self, request: &ConnectRequest) -> Result<u64, TransportError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(TransportError::Connect("loopback broker offline".to_string()));
        }

        // A second connection with the same id takes over, as on a real broker.
        let previous = state
            .clients
            .iter()
            .find(|(_, client)| client.client_id == request.client_id)
            .map(|(session, _)| *session);
        if let Some(session) = previous {
            state.clients.remove(&session);
        }

        state.next_session += 1;
        let session = state.next_session;
        state.clients.insert(
            session,
            Client {
                client_id: request.client_id.clone(),
                filters: Vec::new(),
                inbox: VecDeque::new(),
                last_will: request.last_will.clone(),
            },
        );
        Ok(session)
    }

    fn is_attached(&self, session: u64) -> bool {
        self.state.lock().clients.contains_key(&session)
    }

    fn detach(&self, session: u64) {
        self.state.lock().clients.remove(&session);
    }

    fn with_client<R>(&self, session: u64, f: impl FnOnce(&mut BrokerState, u64) -> R) -> Result<R, TransportError> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(&session) {
            return Err(TransportError::NotConnected);
        }
        Ok(f(&mut state, session))
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    Connecting(ConnectRequest),
    Connected(u64),
}

/// [`Transport`] talking to a [`LoopbackBroker`].
///
/// The connection completes on the first `poll_connect` after `connect`.
#[derive(Debug)]
pub struct LoopbackTransport {
    broker: LoopbackBroker,
    phase: Phase,
}

impl LoopbackTransport {
    /// Create an idle transport on `broker`.
    #[must_use]
    pub fn new(broker: LoopbackBroker) -> Self {
        Self {
            broker,
            phase: Phase::Idle,
        }
    }

    fn session(&self) -> Result<u64, TransportError> {
        match self.phase {
            Phase::Connected(session) if self.broker.is_attached(session) => Ok(session),
            _ => Err(TransportError::NotConnected),
        }
    }
}

impl Transport for LoopbackTransport {
    fn connect(&mut self, request: &ConnectRequest) -> Result<(), TransportError> {
        if matches!(self.phase, Phase::Idle) {
            self.phase = Phase::Connecting(request.clone());
        }
        Ok(())
    }

    fn poll_connect(&mut self) -> Poll<Result<(), TransportError>> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => Poll::Ready(Err(TransportError::NotConnected)),
            Phase::Connecting(request) => match self.broker.attach(&request) {
                Ok(session) => {
                    self.phase = Phase::Connected(session);
                    Poll::Ready(Ok(()))
                }
                Err(e) => Poll::Ready(Err(e)),
            },
            Phase::Connected(session) => {
                if self.broker.is_attached(session) {
                    self.phase = Phase::Connected(session);
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(TransportError::NotConnected))
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.session().is_ok()
    }

    fn disconnect(&mut self) {
        if let Phase::Connected(session) = std::mem::replace(&mut self.phase, Phase::Idle) {
            self.broker.detach(session);
        }
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let filter = TopicFilter::new(topic).map_err(|e| TransportError::Subscribe(e.to_string()))?;
        let session = self.session()?;
        self.broker.with_client(session, |state, session| {
            let retained: Vec<Message> = state
                .retained
                .iter()
                .filter(|(retained_topic, _)| filter.matches(retained_topic))
                .map(|(retained_topic, payload)| Message::new(retained_topic.as_str(), payload.as_slice()))
                .collect();
            if let Some(client) = state.clients.get_mut(&session) {
                client.filters.retain(|(existing, _)| existing.pattern() != topic);
                client.filters.push((filter, qos));
                client.inbox.extend(retained);
            }
        })
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let session = self.session()?;
        self.broker.with_client(session, |state, session| {
            if let Some(client) = state.clients.get_mut(&session) {
                client.filters.retain(|(existing, _)| existing.pattern() != topic);
            }
        })
    }

    fn publish(&mut self, topic: &str, payload: &[u8], _qos: QoS, retain: bool) -> Result<(), TransportError> {
        let session = self.session()?;
        self.broker
            .with_client(session, |state, _| state.route(topic, payload, retain))
    }

    fn try_receive(&mut self) -> Option<Message> {
        let session = self.session().ok()?;
        self.broker
            .with_client(session, |state, session| {
                state
                    .clients
                    .get_mut(&session)
                    .and_then(|client| client.inbox.pop_front())
            })
            .ok()
            .flatten()
    }

    fn port(&self) -> u16 {
        0
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
