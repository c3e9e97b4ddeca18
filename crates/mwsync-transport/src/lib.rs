//! # MixedWorld Sync Transport
//!
//! Backend-specific MQTT clients behind one small, non-blocking contract.
//!
//! ## Backends
//!
//! - [`MqttTransport`]: native MQTT 3.1.1 over TCP or TLS (`rumqttc`). The
//!   blocking handshake and all socket I/O run on a dedicated worker thread;
//!   the caller only ever polls.
//! - [`LoopbackTransport`]: in-process broker with retained messages and
//!   wildcard routing, for tests and offline sessions.
//!
//! A backend instance serves one connection attempt. Connection managers ask
//! a [`TransportFactory`] for a fresh instance per attempt.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker_url;
pub mod factory;
pub mod loopback;
mod pending;
pub mod rumqtt;
pub mod tls;

use mwsync_proto::{LastWill, Message, QoS};
use std::task::Poll;
use std::time::Duration;

pub use broker_url::BrokerUrl;
pub use factory::{MqttFactory, TransportFactory};
pub use loopback::{LoopbackBroker, LoopbackTransport};
pub use rumqtt::MqttTransport;
pub use tls::CertificatePolicy;

/// Default plain MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default MQTT-over-TLS port.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Username / password pair sent with CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

/// Everything a transport needs for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// MQTT client identifier
    pub client_id: String,
    /// Will registered with the broker
    pub last_will: Option<LastWill>,
    /// Optional authentication
    pub credentials: Option<Credentials>,
}

/// Where and how to reach the broker.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Host name or IP address
    pub host: String,
    /// Port; `0` selects the backend default
    pub port: u16,
    /// TLS certificate handling
    pub tls: CertificatePolicy,
    /// MQTT keep-alive interval
    pub keep_alive: Duration,
    /// Length of one wait cycle for pending acknowledgements on disconnect
    pub drain_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            tls: CertificatePolicy::Disabled,
            keep_alive: Duration::from_secs(60),
            drain_timeout: Duration::from_millis(500),
        }
    }
}

impl BrokerSettings {
    /// The port to dial, resolving `0` to the default for the TLS mode.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        match (self.port, self.tls.is_enabled()) {
            (0, false) => DEFAULT_PORT,
            (0, true) => DEFAULT_TLS_PORT,
            (port, _) => port,
        }
    }
}

/// Backend-specific MQTT client.
///
/// All methods return promptly. `connect` only starts a handshake, which is
/// driven to completion by calling `poll_connect` once per scheduler tick.
pub trait Transport {
    /// Start connecting. A no-op while already connecting or connected.
    ///
    /// # Errors
    ///
    /// Returns error if the attempt cannot even be started (bad TLS setup,
    /// worker spawn failure).
    fn connect(&mut self, request: &ConnectRequest) -> Result<(), TransportError>;

    /// Drive a pending connect.
    fn poll_connect(&mut self) -> Poll<Result<(), TransportError>>;

    /// Whether the link is up.
    fn is_connected(&self) -> bool;

    /// Close the link, waiting (bounded) for acknowledged publishes first.
    ///
    /// Safe to call repeatedly and while a connect is still in flight.
    fn disconnect(&mut self);

    /// Subscribe to a topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the request cannot be queued.
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Remove a subscription.
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the request cannot be queued.
    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Publish a message.
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the request cannot be queued.
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), TransportError>;

    /// Pop the next received message, if any.
    fn try_receive(&mut self) -> Option<Message>;

    /// Port this transport dials.
    fn port(&self) -> u16;
}

/// Errors for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Broker URL could not be parsed
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Handshake failed
    #[error("connection error: {0}")]
    Connect(String),
    /// Operation needs an open link
    #[error("not connected")]
    NotConnected,
    /// Subscribe or unsubscribe failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// TLS configuration failed
    #[error("tls error: {0}")]
    Tls(String),
    /// Worker thread could not be started
    #[error("worker error: {0}")]
    Worker(String),
}
