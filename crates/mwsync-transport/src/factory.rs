//! Per-attempt transport construction.

use crate::{BrokerSettings, LoopbackBroker, LoopbackTransport, MqttTransport, Transport, TransportError};

/// Creates a fresh [`Transport`] for every connection attempt.
pub trait TransportFactory {
    /// Build an idle transport.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be set up.
    fn create(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Factory for the native `rumqttc` backend.
#[derive(Debug, Clone)]
pub struct MqttFactory {
    settings: BrokerSettings,
}

impl MqttFactory {
    /// Create a factory dialing `settings`.
    #[must_use]
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }

    /// Broker settings used for new transports.
    #[must_use]
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }
}

impl TransportFactory for MqttFactory {
    fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(MqttTransport::new(self.settings.clone())))
    }
}

impl TransportFactory for LoopbackBroker {
    fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(LoopbackTransport::new(self.clone())))
    }
}
