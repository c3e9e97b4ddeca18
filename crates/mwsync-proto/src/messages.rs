//! Protocol messages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// MQTT delivery guarantee.
///
/// Ordered so that `max` picks the stronger guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce = 0,
    /// Acknowledged delivery, duplicates possible
    AtLeastOnce = 1,
    /// Four-way handshake delivery
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(MessageError::InvalidQoS(other)),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", *self as u8)
    }
}

/// A received publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Last-will-and-testament registered with the broker at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Topic the will is published on
    pub topic: String,
    /// Will payload
    pub payload: Vec<u8>,
    /// Delivery guarantee of the will
    pub qos: QoS,
    /// Whether the broker retains the will
    pub retain: bool,
}

impl LastWill {
    /// Create a new last will.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

/// Sender metadata of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Stable id of the publishing peer
    pub id: String,
    /// Apply the update even on the peer that sent it
    #[serde(default)]
    pub echo: bool,
}

/// Payload section of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    /// JSON encoding of the property value, carried as a string
    #[serde(alias = "Value")]
    pub value: String,
}

/// JSON wrapper published for every replicated property flush.
///
/// ```json
/// {"meta":{"id":"377B546F","echo":false},"data":{"value":"{\"x\":1}"}}
/// ```
///
/// The capitalised `Meta` / `Data` / `Value` spelling is accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender metadata
    #[serde(alias = "Meta")]
    pub meta: Meta,
    /// Serialized value
    #[serde(alias = "Data")]
    pub data: Data,
}

impl Envelope {
    /// Wrap a value for publishing.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn wrap<T: Serialize>(sender_id: impl Into<String>, echo: bool, value: &T) -> Result<Self, MessageError> {
        let value = serde_json::to_string(value).map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(Self {
            meta: Meta {
                id: sender_id.into(),
                echo,
            },
            data: Data { value },
        })
    }

    /// Whether this envelope was published by `peer_id`.
    #[must_use]
    pub fn is_from(&self, peer_id: &str) -> bool {
        self.meta.id == peer_id
    }

    /// Decode the carried value.
    ///
    /// # Errors
    ///
    /// Returns error if the value does not deserialize into `T`.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_str(&self.data.value).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not an envelope.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// QoS level outside 0..=2
    #[error("invalid QoS level: {0}")]
    InvalidQoS(u8),
}
