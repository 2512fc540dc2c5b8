//! # Upstream Message Bus
//!
//! In-process fan-in point between whatever receives network traffic and the
//! consumers that act on it (the filter dispatcher among them).
//!
//! Each [`Subscription`] owns a bounded channel. [`MessageBus::publish`]
//! awaits capacity on every matching channel, so a slow consumer applies
//! back-pressure to the producer instead of silently losing messages.
//! Subscriptions whose receiver has been dropped are skipped and reaped.
//!
//! | Subscription filter | Receives |
//! |---------------------|----------|
//! | `None` | every envelope |
//! | `Some(topic)` | envelopes whose pubsub topic equals `topic` |

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::messages::{Message, MessageHash};

/// Channel capacity of each subscription.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

/// A message together with the pubsub topic it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    message: Message,
    pubsub_topic: String,
    hash: MessageHash,
}

impl Envelope {
    pub fn new(message: Message, pubsub_topic: impl Into<String>) -> Self {
        let pubsub_topic = pubsub_topic.into();
        let hash = envelope_hash(&pubsub_topic, &message);
        Self {
            message,
            pubsub_topic,
            hash,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn pubsub_topic(&self) -> &str {
        &self.pubsub_topic
    }

    pub fn hash(&self) -> &MessageHash {
        &self.hash
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

fn envelope_hash(pubsub_topic: &str, message: &Message) -> MessageHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(pubsub_topic.as_bytes());
    hasher.update(&message.payload);
    hasher.update(message.content_topic.as_bytes());
    if let Some(meta) = &message.meta {
        hasher.update(meta);
    }
    *hasher.finalize().as_bytes()
}

struct Slot {
    topic: Option<String>,
    tx: mpsc::Sender<Arc<Envelope>>,
}

#[derive(Default)]
struct BusInner {
    slots: DashMap<u64, Slot>,
    next_id: AtomicU64,
}

/// Multi-consumer broadcast of upstream envelopes.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer, optionally restricted to one pubsub topic.
    pub fn subscribe(&self, pubsub_topic: Option<&str>) -> Subscription {
        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.slots.insert(
            id,
            Slot {
                topic: pubsub_topic.map(str::to_string),
                tx,
            },
        );
        Subscription {
            ch: rx,
            unsubscriber: Unsubscriber {
                id,
                bus: Arc::downgrade(&self.inner),
                done: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Deliver `envelope` to every matching subscription.
    ///
    /// Returns how many subscriptions accepted it.
    pub async fn publish(&self, envelope: Envelope) -> usize {
        let envelope = Arc::new(envelope);

        // Senders are cloned out so no shard lock is held across an await.
        let targets: Vec<(u64, mpsc::Sender<Arc<Envelope>>)> = self
            .inner
            .slots
            .iter()
            .filter(|slot| {
                slot.topic
                    .as_deref()
                    .is_none_or(|topic| topic == envelope.pubsub_topic())
            })
            .map(|slot| (*slot.key(), slot.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(envelope.clone()).await.is_ok() {
                delivered += 1;
            } else {
                self.inner.slots.remove(&id);
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.slots.len()
    }
}

/// Receiving end of a bus registration.
pub struct Subscription {
    pub ch: mpsc::Receiver<Arc<Envelope>>,
    unsubscriber: Unsubscriber,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.unsubscriber.unsubscribe();
    }

    /// Split into the receiver and a handle that can end the registration later.
    pub fn into_parts(self) -> (mpsc::Receiver<Arc<Envelope>>, Unsubscriber) {
        (self.ch, self.unsubscriber)
    }
}

/// Detaches a subscription from its bus. Safe to call any number of times.
#[derive(Clone)]
pub struct Unsubscriber {
    id: u64,
    bus: Weak<BusInner>,
    done: Arc<AtomicBool>,
}

impl Unsubscriber {
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            // Dropping the sender closes the channel once it drains.
            bus.slots.remove(&self.id);
        }
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Unsubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscriber")
            .field("id", &self.id)
            .field("done", &self.is_unsubscribed())
            .finish()
    }
}
