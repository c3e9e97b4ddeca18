//! Single boolean on a retained topic, one byte on the wire.

use crate::manager::{ConnectionManager, SubscriptionHandle};
use crate::SyncError;
use mwsync_proto::QoS;
use std::cell::Cell;
use std::rc::Rc;

const PAYLOAD_TRUE: [u8; 1] = [1];
const PAYLOAD_FALSE: [u8; 1] = [0];

/// Boolean endpoint.
#[derive(Debug)]
pub struct Endpoint {
    topic: String,
    retained: bool,
    value: Rc<Cell<bool>>,
    received: Rc<Cell<bool>>,
    handle: Option<SubscriptionHandle>,
}

impl Endpoint {
    /// Create an endpoint on `topic`. Starts out `false` and unsubscribed.
    #[must_use]
    pub fn new(topic: impl Into<String>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            retained,
            value: Rc::new(Cell::new(false)),
            received: Rc::new(Cell::new(false)),
            handle: None,
        }
    }

    /// Topic of the endpoint.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Last received value.
    #[must_use]
    pub fn value(&self) -> bool {
        self.value.get()
    }

    /// Whether a value arrived since the last call.
    pub fn take_received(&self) -> bool {
        self.received.replace(false)
    }

    /// Start listening. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is not a valid subscription.
    pub fn subscribe(&mut self, manager: &mut ConnectionManager) -> Result<(), SyncError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let value = Rc::clone(&self.value);
        let received = Rc::clone(&self.received);
        let topic = self.topic.clone();
        self.handle = Some(manager.subscribe(&self.topic, QoS::AtMostOnce, move |message| {
            match message.payload.first() {
                Some(byte) => {
                    value.set(*byte != 0);
                    received.set(true);
                }
                None => tracing::warn!(topic, "Ignoring empty endpoint payload"),
            }
        })?);
        Ok(())
    }

    /// Stop listening.
    pub fn unsubscribe(&mut self, manager: &mut ConnectionManager) {
        if let Some(handle) = self.handle.take() {
            manager.unsubscribe(handle);
        }
    }

    /// Publish `value`.
    ///
    /// # Errors
    ///
    /// Returns error if not connected.
    pub fn send(&self, manager: &mut ConnectionManager, value: bool) -> Result<(), SyncError> {
        let payload: &[u8] = if value { &PAYLOAD_TRUE } else { &PAYLOAD_FALSE };
        manager.publish(&self.topic, payload, QoS::AtMostOnce, self.retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{scripted, Call};
    use crate::manager::ConnectionSettings;
    use mwsync_proto::Message;
    use std::time::Instant;

    #[test]
    fn publishes_single_byte() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        manager.connect().unwrap();
        manager.tick(Instant::now());

        let endpoint = Endpoint::new("lab/door", true);
        endpoint.send(&mut manager, true).unwrap();
        endpoint.send(&mut manager, false).unwrap();
        assert_eq!(script.count(|c| *c == Call::Publish("lab/door".into(), vec![1], QoS::AtMostOnce, true)), 1);
        assert_eq!(script.count(|c| *c == Call::Publish("lab/door".into(), vec![0], QoS::AtMostOnce, true)), 1);
    }

    #[test]
    fn decodes_first_byte() {
        let (mut manager, script) = scripted(ConnectionSettings::default());
        let mut endpoint = Endpoint::new("lab/door", true);
        endpoint.subscribe(&mut manager).unwrap();
        endpoint.subscribe(&mut manager).unwrap();
        assert_eq!(manager.subscriptions().callback_count("lab/door"), 1);

        let now = Instant::now();
        manager.connect().unwrap();
        manager.tick(now);
        script.inbound.borrow_mut().push_back(Message::new("lab/door", vec![7]));
        manager.tick(now);
        assert!(endpoint.value());
        assert!(endpoint.take_received());
        assert!(!endpoint.take_received());

        script.inbound.borrow_mut().push_back(Message::new("lab/door", Vec::new()));
        manager.tick(now);
        assert!(endpoint.value());
        assert!(!endpoint.take_received());

        endpoint.unsubscribe(&mut manager);
        assert!(manager.subscriptions().is_empty());
    }
}
