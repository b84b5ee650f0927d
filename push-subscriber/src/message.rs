//! Messages delivered to consumers and their acknowledgment state.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// String key/value pairs attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, or `None` if it is not set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Final decision a consumer made about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgment {
    Acked,
    Nacked,
}

struct AckSlot {
    state: Option<Acknowledgment>,
    notify: Option<oneshot::Sender<Acknowledgment>>,
}

/// A single message received through a push delivery.
///
/// The consumer owns the message once it is received and settles it with
/// [`ack`](Message::ack) or [`nack`](Message::nack). Only the first decision
/// counts; the push handler answers the originating HTTP request from it.
/// Dropping an unsettled message abandons it, which the handler reports
/// as a failure.
pub struct Message {
    /// Unique identifier of the message
    pub uuid: String,
    /// Raw message body
    pub payload: Bytes,
    /// Message attributes
    pub metadata: Metadata,
    ack: Mutex<AckSlot>,
    context: CancellationToken,
}

impl Message {
    pub fn new(uuid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            ack: Mutex::new(AckSlot {
                state: None,
                notify: None,
            }),
            context: CancellationToken::new(),
        }
    }

    /// Marks the message as successfully processed.
    ///
    /// Returns `false` if the message was already nacked. Calling it again
    /// after a successful ack is a no-op returning `true`.
    pub fn ack(&self) -> bool {
        self.settle(Acknowledgment::Acked)
    }

    /// Marks the message as failed.
    ///
    /// Returns `false` if the message was already acked.
    pub fn nack(&self) -> bool {
        self.settle(Acknowledgment::Nacked)
    }

    /// The decision taken so far, if any.
    pub fn acknowledgment(&self) -> Option<Acknowledgment> {
        self.lock_ack().state
    }

    /// Token cancelled once the originating request has been answered.
    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    pub fn set_context(&mut self, context: CancellationToken) {
        self.context = context;
    }

    /// Returns a receiver resolved by the first ack or nack.
    ///
    /// Only one watcher exists at a time; calling this again replaces the
    /// previous one. If the message is already settled the receiver is
    /// ready immediately. If the message is dropped unsettled the receiver
    /// yields an error.
    pub(crate) fn watch(&self) -> oneshot::Receiver<Acknowledgment> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.lock_ack();
        match slot.state {
            Some(decision) => {
                let _ = tx.send(decision);
            }
            None => slot.notify = Some(tx),
        }
        rx
    }

    fn settle(&self, decision: Acknowledgment) -> bool {
        let mut slot = self.lock_ack();
        match slot.state {
            Some(existing) => existing == decision,
            None => {
                slot.state = Some(decision);
                if let Some(tx) = slot.notify.take() {
                    let _ = tx.send(decision);
                }
                true
            }
        }
    }

    fn lock_ack(&self) -> std::sync::MutexGuard<'_, AckSlot> {
        self.ack.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .field("acknowledgment", &self.acknowledgment())
            .finish()
    }
}
