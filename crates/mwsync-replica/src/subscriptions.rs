//! Pattern-keyed callback registry.
//!
//! Many logical subscribers share one wire subscription per pattern. The
//! index decides when the transport must actually (re)subscribe or
//! unsubscribe; the connection manager carries that out.

use mwsync_proto::{FilterError, Message, QoS, TopicFilter};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Message callback shared with the index.
pub type Callback = Rc<dyn Fn(&Message)>;

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

struct Subscription {
    filter: TopicFilter,
    qos: QoS,
    callbacks: BTreeMap<CallbackId, Callback>,
}

/// Registry of live subscriptions.
///
/// A pattern is present iff at least one callback is registered for it.
/// The recorded QoS only ever grows while the pattern lives.
#[derive(Default)]
pub struct SubscriptionIndex {
    entries: BTreeMap<String, Subscription>,
    next_id: u64,
}

impl SubscriptionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `pattern`.
    ///
    /// Returns the callback id and, when the transport must subscribe (new
    /// pattern or QoS upgrade), the QoS to subscribe with.
    ///
    /// # Errors
    ///
    /// Returns error if `pattern` is not a valid topic filter.
    pub fn add(&mut self, pattern: &str, qos: QoS, callback: Callback) -> Result<(CallbackId, Option<QoS>), FilterError> {
        self.next_id += 1;
        let id = CallbackId(self.next_id);

        if let Some(entry) = self.entries.get_mut(pattern) {
            entry.callbacks.insert(id, callback);
            if qos > entry.qos {
                entry.qos = qos;
                return Ok((id, Some(qos)));
            }
            return Ok((id, None));
        }

        let filter = TopicFilter::new(pattern)?;
        let mut callbacks = BTreeMap::new();
        callbacks.insert(id, callback);
        self.entries.insert(
            pattern.to_string(),
            Subscription {
                filter,
                qos,
                callbacks,
            },
        );
        Ok((id, Some(qos)))
    }

    /// Deregister a callback.
    ///
    /// Returns `true` when the pattern lost its last callback and the
    /// transport must unsubscribe.
    pub fn remove(&mut self, pattern: &str, id: CallbackId) -> bool {
        let Some(entry) = self.entries.get_mut(pattern) else {
            return false;
        };
        if entry.callbacks.remove(&id).is_none() {
            return false;
        }
        if entry.callbacks.is_empty() {
            self.entries.remove(pattern);
            return true;
        }
        false
    }

    /// Hand `message` to every callback whose pattern matches its topic.
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, message: &Message) -> usize {
        let targets: Vec<Callback> = self
            .entries
            .values()
            .filter(|entry| entry.filter.matches(&message.topic))
            .flat_map(|entry| entry.callbacks.values().cloned())
            .collect();

        for callback in &targets {
            callback(message);
        }
        targets.len()
    }

    /// Live patterns with their QoS, for replay after a reconnect.
    pub fn patterns(&self) -> impl Iterator<Item = (&str, QoS)> + '_ {
        self.entries
            .iter()
            .map(|(pattern, entry)| (pattern.as_str(), entry.qos))
    }

    /// Recorded QoS of a live pattern.
    #[must_use]
    pub fn qos(&self, pattern: &str) -> Option<QoS> {
        self.entries.get(pattern).map(|entry| entry.qos)
    }

    /// Number of callbacks registered under `pattern`.
    #[must_use]
    pub fn callback_count(&self, pattern: &str) -> usize {
        self.entries
            .get(pattern)
            .map_or(0, |entry| entry.callbacks.len())
    }

    /// Number of live patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no pattern is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SubscriptionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(pattern, entry)| (pattern, (entry.qos, entry.callbacks.len()))),
            )
            .finish()
    }
}
