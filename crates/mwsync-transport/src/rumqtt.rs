//! Native MQTT backend on `rumqttc`.
//!
//! Each connection attempt owns a worker thread running a single-threaded
//! tokio runtime that drives the `rumqttc` event loop. The caller side only
//! queues requests on the `AsyncClient` and reads shared state, so no method
//! here awaits the network (disconnect waits, bounded, for acks).

use crate::pending::{DrainOutcome, PendingAcks};
use crate::{BrokerSettings, ConnectRequest, Transport, TransportError};
use mwsync_proto::{Message, QoS};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 100;

/// How long the worker keeps polling after it sent DISCONNECT.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
    Failed(String),
    Closed,
}

/// State shared between the caller and one worker.
#[derive(Debug)]
struct Link {
    state: Mutex<LinkState>,
    received: Mutex<VecDeque<Message>>,
    pending: PendingAcks,
    cancel: AtomicBool,
}

impl Link {
    fn new() -> Self {
        Self {
            state: Mutex::new(LinkState::Connecting),
            received: Mutex::new(VecDeque::new()),
            pending: PendingAcks::default(),
            cancel: AtomicBool::new(false),
        }
    }

    fn state(&self) -> LinkState {
        self.state.lock().clone()
    }

    /// Link is gone; a failure while still connecting is reported as such.
    fn close(&self, reason: String) {
        {
            let mut state = self.state.lock();
            *state = match *state {
                LinkState::Connecting => LinkState::Failed(reason),
                LinkState::Failed(ref previous) => LinkState::Failed(previous.clone()),
                LinkState::Connected | LinkState::Closed => LinkState::Closed,
            };
        }
        let dropped = self.pending.discard();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped unacknowledged publishes on close");
        }
    }
}

struct Session {
    client: AsyncClient,
    link: Arc<Link>,
}

/// `rumqttc`-backed [`Transport`].
pub struct MqttTransport {
    settings: BrokerSettings,
    session: Option<Session>,
    /// Connect requested while the previous worker was still shutting down
    deferred: Option<ConnectRequest>,
    worker: Option<JoinHandle<()>>,
}

impl MqttTransport {
    /// Create an idle transport.
    #[must_use]
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            session: None,
            deferred: None,
            worker: None,
        }
    }

    fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    fn start(&mut self, request: &ConnectRequest) -> Result<(), TransportError> {
        let port = self.settings.effective_port();
        let mut options = MqttOptions::new(&request.client_id, &self.settings.host, port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);

        if let Some(will) = &request.last_will {
            options.set_last_will(rumqttc::LastWill::new(
                &will.topic,
                will.payload.clone(),
                to_rumqttc(will.qos),
                will.retain,
            ));
        }
        if let Some(credentials) = &request.credentials {
            options.set_credentials(&credentials.username, &credentials.password);
        }
        if let Some(transport) = self.settings.tls.to_rumqttc()? {
            options.set_transport(transport);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let link = Arc::new(Link::new());

        let worker_client = client.clone();
        let worker_link = Arc::clone(&link);
        let worker = thread::Builder::new()
            .name("mwsync-mqtt".to_string())
            .spawn(move || run_worker(eventloop, worker_client, &worker_link))
            .map_err(|e| TransportError::Worker(e.to_string()))?;

        tracing::info!(
            host = %self.settings.host,
            port,
            client_id = %request.client_id,
            tls = self.settings.tls.is_enabled(),
            "Connecting to MQTT broker"
        );

        self.worker = Some(worker);
        self.session = Some(Session { client, link });
        Ok(())
    }

    fn connected_session(&self) -> Result<&Session, TransportError> {
        self.session
            .as_ref()
            .filter(|session| session.link.state() == LinkState::Connected)
            .ok_or(TransportError::NotConnected)
    }
}

impl Transport for MqttTransport {
    fn connect(&mut self, request: &ConnectRequest) -> Result<(), TransportError> {
        if self.session.is_some() || self.deferred.is_some() {
            return Ok(());
        }
        if self.worker_running() {
            tracing::debug!("Previous MQTT worker still running, deferring connect");
            self.deferred = Some(request.clone());
            return Ok(());
        }
        self.start(request)
    }

    fn poll_connect(&mut self) -> Poll<Result<(), TransportError>> {
        if self.session.is_none() {
            let Some(request) = self.deferred.take() else {
                return Poll::Ready(Err(TransportError::NotConnected));
            };
            if self.worker_running() {
                self.deferred = Some(request);
                return Poll::Pending;
            }
            if let Err(e) = self.start(&request) {
                return Poll::Ready(Err(e));
            }
        }

        let Some(session) = &self.session else {
            return Poll::Ready(Err(TransportError::NotConnected));
        };
        match session.link.state() {
            LinkState::Connecting => Poll::Pending,
            LinkState::Connected => Poll::Ready(Ok(())),
            LinkState::Failed(reason) => {
                self.session = None;
                Poll::Ready(Err(TransportError::Connect(reason)))
            }
            LinkState::Closed => {
                self.session = None;
                Poll::Ready(Err(TransportError::Connect(
                    "connection closed during handshake".to_string(),
                )))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected_session().is_ok()
    }

    fn disconnect(&mut self) {
        self.deferred = None;
        let Some(session) = self.session.take() else {
            return;
        };

        // Under the state lock so a ConnAck racing with us sees the flag.
        let connected = {
            let state = session.link.state.lock();
            session.link.cancel.store(true, Ordering::SeqCst);
            *state == LinkState::Connected
        };

        if !connected {
            tracing::debug!("Disconnect while not connected, worker will close the link");
            return;
        }

        if let DrainOutcome::TimedOut { discarded } =
            session.link.pending.wait_drained(self.settings.drain_timeout)
        {
            tracing::warn!(discarded, "Timed out waiting for publish acknowledgements");
        }
        if let Err(e) = session.client.try_disconnect() {
            tracing::debug!(error = %e, "Failed to queue MQTT disconnect");
        }
        tracing::info!("Disconnected from MQTT broker");
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let session = self.connected_session()?;
        session
            .client
            .try_subscribe(topic, to_rumqttc(qos))
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let session = self.connected_session()?;
        session
            .client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), TransportError> {
        let session = self.connected_session()?;
        let tracked = qos != QoS::AtMostOnce;
        if tracked {
            session.link.pending.queue();
        }
        session
            .client
            .try_publish(topic, to_rumqttc(qos), retain, payload.to_vec())
            .map_err(|e| {
                if tracked {
                    session.link.pending.unqueue();
                }
                TransportError::Publish(e.to_string())
            })
    }

    fn try_receive(&mut self) -> Option<Message> {
        self.session.as_ref()?.link.received.lock().pop_front()
    }

    fn port(&self) -> u16 {
        self.settings.effective_port()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn run_worker(eventloop: EventLoop, client: AsyncClient, link: &Link) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            link.close(format!("failed to start worker runtime: {e}"));
            return;
        }
    };
    runtime.block_on(drive(eventloop, client, link));
    tracing::debug!("MQTT worker stopped");
}

/// What the worker loop does after one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// DISCONNECT is queued or sent; poll on for at most [`CLOSE_GRACE`]
    Closing,
    Stop,
}

/// Apply one event-loop event to the shared link state.
fn handle_event(link: &Link, client: &AsyncClient, event: Event) -> Flow {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code != ConnectReturnCode::Success {
                link.close(format!("broker refused connection: {:?}", ack.code));
                return Flow::Stop;
            }
            // Checked under the state lock; `disconnect` sets the flag under it too.
            let mut state = link.state.lock();
            if link.cancel.load(Ordering::SeqCst) {
                *state = LinkState::Closed;
                drop(state);
                tracing::debug!("Disconnect requested during handshake, closing");
                if let Err(e) = client.try_disconnect() {
                    tracing::debug!(error = %e, "Failed to queue MQTT disconnect");
                    return Flow::Stop;
                }
                Flow::Closing
            } else {
                *state = LinkState::Connected;
                drop(state);
                tracing::info!("Connected to MQTT broker");
                Flow::Continue
            }
        }
        Event::Incoming(Packet::Publish(publish)) => {
            tracing::trace!(
                topic = %publish.topic,
                payload_len = publish.payload.len(),
                "Received MQTT message"
            );
            link.received
                .lock()
                .push_back(Message::new(publish.topic.clone(), publish.payload.to_vec()));
            Flow::Continue
        }
        Event::Incoming(Packet::PubAck(ack)) => {
            link.pending.acknowledge(ack.pkid);
            Flow::Continue
        }
        Event::Incoming(Packet::PubComp(comp)) => {
            link.pending.acknowledge(comp.pkid);
            Flow::Continue
        }
        Event::Incoming(Packet::SubAck(_)) => {
            tracing::debug!("Subscription acknowledged");
            Flow::Continue
        }
        Event::Outgoing(Outgoing::Publish(pkid)) if pkid != 0 => {
            link.pending.sent(pkid);
            Flow::Continue
        }
        Event::Outgoing(Outgoing::Disconnect) => Flow::Closing,
        _ => Flow::Continue,
    }
}

async fn drive(mut eventloop: EventLoop, client: AsyncClient, link: &Link) {
    let mut closing = false;
    loop {
        let event = if closing {
            match tokio::time::timeout(CLOSE_GRACE, eventloop.poll()).await {
                Ok(event) => event,
                Err(_) => break,
            }
        } else {
            eventloop.poll().await
        };

        match event {
            Ok(event) => match handle_event(link, &client, event) {
                Flow::Continue => {}
                Flow::Closing => closing = true,
                Flow::Stop => break,
            },
            Err(e) => {
                if closing {
                    tracing::debug!(error = %e, "MQTT connection closed");
                } else {
                    tracing::warn!(error = %e, "MQTT connection lost");
                }
                link.close(e.to_string());
                return;
            }
        }
    }
    link.close("worker stopped".to_string());
}
